//! Per-account protocol cursor.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_MAX_FOLDERS, INITIAL_POLICY_KEY, INITIAL_SYNC_KEY,
};
use crate::pending::AccountId;

bitflags! {
    /// Commands the server advertised during capability discovery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const SYNC = 1 << 0;
        const FOLDER_SYNC = 1 << 1;
        const FOLDER_CREATE = 1 << 2;
        const FOLDER_DELETE = 1 << 3;
        const FOLDER_UPDATE = 1 << 4;
        const MOVE_ITEMS = 1 << 5;
        const SEND_MAIL = 1 << 6;
        const MEETING_RESPONSE = 1 << 7;
        const ITEM_OPERATIONS = 1 << 8;
        const SEARCH = 1 << 9;
        const PROVISION = 1 << 10;
        const PING = 1 << 11;
        const SETTINGS = 1 << 12;
    }
}

impl Capabilities {
    /// Flag for a single wire command name, if known.
    pub fn for_command(name: &str) -> Option<Self> {
        let flag = match name {
            "Sync" => Self::SYNC,
            "FolderSync" => Self::FOLDER_SYNC,
            "FolderCreate" => Self::FOLDER_CREATE,
            "FolderDelete" => Self::FOLDER_DELETE,
            "FolderUpdate" => Self::FOLDER_UPDATE,
            "MoveItems" => Self::MOVE_ITEMS,
            "SendMail" => Self::SEND_MAIL,
            "MeetingResponse" => Self::MEETING_RESPONSE,
            "ItemOperations" => Self::ITEM_OPERATIONS,
            "Search" => Self::SEARCH,
            "Provision" => Self::PROVISION,
            "Ping" => Self::PING,
            "Settings" => Self::SETTINGS,
            _ => return None,
        };
        Some(flag)
    }

    /// Parse the comma-separated `MS-ASProtocolCommands` header.
    pub fn from_commands_header(value: &str) -> Self {
        value
            .split(',')
            .filter_map(|name| Self::for_command(name.trim()))
            .fold(Self::empty(), |acc, flag| acc | flag)
    }
}

/// Side effect a status code has on the protocol cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEffect {
    ResetPolicyKey,
    MarkWipeRequired,
    CountAuthFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolState {
    pub account_id: AccountId,
    /// Bumped by every committed update.
    pub revision: i64,
    pub folder_sync_key: String,
    pub policy_key: String,
    pub protocol_version: String,
    /// Incremented whenever the folder hierarchy must be fully resynchronized.
    pub folder_sync_epoch: u32,
    pub heartbeat_secs: u32,
    pub max_folders: u32,
    pub wipe_required: bool,
    pub consecutive_401: u32,
    pub capabilities: Capabilities,
}

impl ProtocolState {
    pub fn initial(account_id: AccountId, protocol_version: &str) -> Self {
        Self {
            account_id,
            revision: 0,
            folder_sync_key: INITIAL_SYNC_KEY.to_string(),
            policy_key: INITIAL_POLICY_KEY.to_string(),
            protocol_version: protocol_version.to_string(),
            folder_sync_epoch: 0,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            max_folders: DEFAULT_MAX_FOLDERS,
            wipe_required: false,
            consecutive_401: 0,
            capabilities: Capabilities::empty(),
        }
    }

    /// Discard the folder sync key so the next folder sync starts from scratch.
    pub fn reset_folder_sync(&mut self) {
        self.folder_sync_key = INITIAL_SYNC_KEY.to_string();
        self.folder_sync_epoch += 1;
    }

    pub fn is_provisioned(&self) -> bool {
        self.policy_key != INITIAL_POLICY_KEY
    }

    pub fn apply(&mut self, effect: StateEffect) {
        match effect {
            StateEffect::ResetPolicyKey => self.policy_key = INITIAL_POLICY_KEY.to_string(),
            StateEffect::MarkWipeRequired => self.wipe_required = true,
            StateEffect::CountAuthFailure => self.consecutive_401 += 1,
        }
    }

    /// Supports the command, or has not run discovery yet.
    pub fn allows(&self, capability: Capabilities) -> bool {
        self.capabilities.is_empty() || self.capabilities.contains(capability)
    }
}
