//! Names, images and environment contract shared by every fleet operation

/// Binary executed inside the agent image
pub const CMD_LOCAL_AGENT: &str = "longhornctl-local";
/// Binary name of this CLI
pub const CMD_REMOTE: &str = "longhornctl";

pub const SUBCMD_CHECK: &str = "check";
pub const SUBCMD_EXPORT: &str = "export";
pub const SUBCMD_GET: &str = "get";
pub const SUBCMD_INSTALL: &str = "install";
pub const SUBCMD_TRIM: &str = "trim";
pub const SUBCMD_PREFLIGHT: &str = "preflight";
pub const SUBCMD_REPLICA: &str = "replica";
pub const SUBCMD_VOLUME: &str = "volume";
pub const SUBCMD_STOP: &str = "stop";

pub const IMAGE_PAUSE: &str = "registry.k8s.io/pause:3.1";
pub const IMAGE_BCI_BASE: &str = "registry.suse.com/bci/bci-base:15.6";
pub const IMAGE_CLI: &str = concat!("longhornio/longhorn-cli:v", env!("CARGO_PKG_VERSION"));
pub const IMAGE_ENGINE: &str = concat!("longhornio/longhorn-engine:v", env!("CARGO_PKG_VERSION"));

pub const CONTAINER_INIT: &str = "init-longhornctl";
pub const CONTAINER_OUTPUT: &str = "output-longhornctl";
pub const CONTAINER_PAUSE: &str = "pause";
pub const CONTAINER_ENGINE: &str = "engine";
pub const CONTAINER_COS_AGENT: &str = "longhornctl";

pub const APP_PREFLIGHT_CHECKER: &str = "longhorn-preflight-checker";
pub const APP_PREFLIGHT_INSTALLER: &str = "longhorn-preflight-installer";
pub const APP_PREFLIGHT_COS: &str = "longhorn-gke-cos-node-agent";
pub const APP_REPLICA_GETTER: &str = "longhorn-replica-getter";
pub const APP_REPLICA_EXPORTER: &str = "longhorn-replica-exporter";
pub const APP_VOLUME_TRIMMER: &str = "longhorn-volume-trimmer";

/// Label key carrying the session name on the workload and its pods
pub const LABEL_APP: &str = "app";

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_LONGHORN_NAMESPACE: &str = "longhorn-system";
pub const DEFAULT_DATA_DIRECTORY: &str = "/var/lib/longhorn";
pub const LONGHORN_SERVICE_ACCOUNT: &str = "longhorn-service-account";

pub const VOLUME_HOST: &str = "host";
pub const VOLUME_HOST_DIR: &str = "/host";
pub const VOLUME_SHARED: &str = "shared";
pub const VOLUME_SHARED_DIR: &str = "/shared";
pub const VOLUME_HOST_EXPORTER: &str = "host-exporter";
pub const VOLUME_HOST_EXPORTER_DIR: &str = "/host-exporter";
pub const VOLUME_ENTRYPOINT: &str = "entrypoint";
pub const VOLUME_ENTRYPOINT_DIR: &str = "/scripts";
pub const VOLUME_REPLICA: &str = "volume";
pub const VOLUME_REPLICA_DIR: &str = "/volume";

pub const FILE_OUTPUT_JSON: &str = "output.json";
pub const FILE_PRE_STOP_SCRIPT: &str = "pre-stop.sh";
pub const FILE_ENTRYPOINT: &str = "entrypoint.sh";

pub const LOG_PREFIX_ERROR: &str = "ERROR: ";
pub const LOG_PREFIX_WARN: &str = "WARN: ";

pub const ENV_CURRENT_NODE_ID: &str = "CURRENT_NODE_ID";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_OUTPUT_FILE_PATH: &str = "OUTPUT_FILE_PATH";
pub const ENV_DATA_DIRECTORY: &str = "LONGHORN_DATA_DIRECTORY";
pub const ENV_LONGHORN_NAMESPACE: &str = "LONGHORN_NAMESPACE";
pub const ENV_REPLICA_NAME: &str = "REPLICA_NAME";
pub const ENV_VOLUME_NAME: &str = "VOLUME_NAME";
pub const ENV_DRIVER_OVERRIDE: &str = "DRIVER_OVERRIDE";
pub const ENV_ENABLE_SPDK: &str = "ENABLE_SPDK";
pub const ENV_HUGE_PAGE_SIZE: &str = "HUGEMEM";
pub const ENV_PCI_ALLOWED: &str = "PCI_ALLOWED";
pub const ENV_UIO_DRIVER: &str = "UIO_DRIVER";
pub const ENV_UPDATE_PACKAGE_LIST: &str = "UPDATE_PACKAGE_LIST";
pub const ENV_SPDK_OPTIONS: &str = "SPDK_OPTIONS";

/// Field path the platform resolves to the scheduling node's name
pub const FIELD_NODE_NAME: &str = "spec.nodeName";

/// Path of the JSON document written by run-to-completion agents
pub fn output_file_path() -> String {
    format!("{}/{}", VOLUME_SHARED_DIR, FILE_OUTPUT_JSON)
}
