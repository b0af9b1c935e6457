//! Shared constants for the staging proxy.

/// Session name used when the client never calls `set_session_name`.
pub const DEFAULT_SESSION_NAME: &str = "JobStageSession";

/// Directory name appended to the platform cache dir for persisted stores.
pub const STORE_DIR_NAME: &str = "jobstage";

/// Version of the serialized awaited-job layout. Bump on incompatible changes;
/// stores written with a different version are discarded on load.
pub const STORE_SCHEMA_VERSION: u32 = 2;

/// Placeholder segment resolved to the task id once the scheduler reports it.
pub const TASKID_PLACEHOLDER: &str = "[TASKID]";

/// Default number of concurrent transfer workers.
pub const DEFAULT_TRANSFER_WORKERS: usize = 20;

/// Sub-folder of the scratch folder receiving pushed input data.
pub const INPUT_FOLDER_NAME: &str = "input";

/// Sub-folder of the scratch folder receiving task output data.
pub const OUTPUT_FOLDER_NAME: &str = "output";

/// Job metadata key holding the absolute local input folder.
pub const METADATA_INPUT_FOLDER: &str = "client_input_data_folder";

/// Job metadata key holding the absolute local output folder.
pub const METADATA_OUTPUT_FOLDER: &str = "client_output_data_folder";

/// Job metadata key holding the client-side push URL of the scratch input folder.
pub const METADATA_PUSH_URL: &str = "push_url";

/// Job metadata key holding the client-side pull URL of the scratch output folder.
pub const METADATA_PULL_URL: &str = "pull_url";

/// URL scheme prefix of locally reachable storage spaces.
pub const FILE_SCHEME_PREFIX: &str = "file:";
