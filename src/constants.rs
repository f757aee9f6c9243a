//! Protocol constants and engine tuning defaults
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Protocol version requested until capability discovery negotiates one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "14.1";

/// Protocol versions this engine speaks, lowest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["12.0", "12.1", "14.0", "14.1"];

/// Sync key the server expects from a client with no sync state.
pub const INITIAL_SYNC_KEY: &str = "0";

/// Policy key sent before the device has been provisioned.
pub const INITIAL_POLICY_KEY: &str = "0";

/// Policy type requested during provisioning.
pub const POLICY_TYPE: &str = "MS-EAS-Provisioning-WBXML";

/// Device type reported in the request query string.
pub const DEFAULT_DEVICE_TYPE: &str = "airsync";

/// URL path of the ActiveSync endpoint.
pub const DEFAULT_ENDPOINT_PATH: &str = "/Microsoft-Server-ActiveSync";

/// Consecutive HTTP 401 responses tolerated before discovery is re-run.
/// A stale server address looks like bad credentials to the client.
pub const CONSECUTIVE_401_BEFORE_REDISCOVER: u32 = 5;

/// Heartbeat interval in seconds before the server negotiates one.
pub const DEFAULT_HEARTBEAT_SECS: u32 = 600;

/// Folders watched by a single Ping before the server negotiates a limit.
pub const DEFAULT_MAX_FOLDERS: u32 = 200;

/// Delay used when a 503 carries a throttle marker but no Retry-After.
pub const DEFAULT_THROTTLE_DELAY_SECS: u64 = 60;

/// Folder type assigned to user-created mail folders.
pub const FOLDER_TYPE_USER_MAIL: u32 = 12;

/// Folder type of user-created calendars.
pub const FOLDER_TYPE_USER_CALENDAR: u32 = 13;

/// Capacity of the per-account controller command channel.
pub const CONTROLLER_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the engine-wide controller event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Prefix marking a locally generated placeholder server id.
pub const PLACEHOLDER_PREFIX: &str = "ph:";

/// Delay before retrying a move the server reported as temporarily locked.
pub const LOCKED_ITEM_RETRY_SECS: i64 = 60;

/// Directory search result window requested from the server.
pub const SEARCH_RANGE: &str = "0-49";
