//! Protocol Constants
//!
//! Message codes, disconnect reasons, roles and master modes of the
//! Sauerbraten network protocol (version 259). Every value here is fixed by
//! deployed clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Game protocol version.
pub const PROTOCOL_VERSION: i32 = 259;

/// Extended info protocol version.
pub const EXTINFO_VERSION: i32 = 105;

/// Channel for position updates (unreliable).
pub const POSITION_CHANNEL: u8 = 0;

/// Channel for everything else (reliable).
pub const MESSAGE_CHANNEL: u8 = 1;

// =============================================================================
// MESSAGE CODES
// =============================================================================

macro_rules! message_codes {
    ($($(#[$doc:meta])* $name:ident = $code:expr,)*) => {
        /// Message code leading every message in a datagram.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(i32)]
        pub enum Msg {
            $($(#[$doc])* $name = $code,)*
        }

        impl Msg {
            /// Look up a message by wire code.
            pub fn from_code(code: i32) -> Option<Msg> {
                match code {
                    $($code => Some(Msg::$name),)*
                    _ => None,
                }
            }
        }
    };
}

message_codes! {
    /// Client join request (name, model, password hash, auth domain, auth name)
    Join = 0,
    /// Server greeting on connect
    ServerInfo = 1,
    /// Start of the welcome packet
    Welcome = 2,
    /// Describes another client
    InitializeClient = 3,
    /// Position update
    Position = 4,
    /// Chat message
    ChatMessage = 5,
    /// Sound effect
    Sound = 6,
    /// Client left
    Leave = 7,
    /// Weapon fired
    Shoot = 8,
    /// Projectile exploded
    Explode = 9,
    /// Suicide request
    Suicide = 10,
    /// Player died
    Died = 11,
    /// Damage report
    Damage = 12,
    /// Knockback
    HitPush = 13,
    /// Shot effects for other clients
    ShotEffects = 14,
    /// Explosion effects for other clients
    ExplodeEffects = 15,
    /// Respawn request
    TrySpawn = 16,
    /// Granted spawn state
    SpawnState = 17,
    /// Spawn confirmation
    Spawn = 18,
    /// Forced death
    ForceDeath = 19,
    /// Weapon switch
    ChangeWeapon = 20,
    /// Taunt
    Taunt = 21,
    /// Map change
    MapChange = 22,
    /// Map vote
    MapVote = 23,
    /// Team scores
    TeamInfo = 24,
    /// Item respawned
    ItemSpawn = 25,
    /// Item pickup request
    ItemPickup = 26,
    /// Item pickup accepted
    ItemAccepted = 27,
    /// Teleporter used
    Teleport = 28,
    /// Jump pad used
    JumpPad = 29,
    /// Latency probe
    Ping = 30,
    /// Latency reply
    Pong = 31,
    /// Reported ping
    ClientPing = 32,
    /// Seconds left in the match
    TimeLeft = 33,
    /// Intermission request
    ForceIntermission = 34,
    /// Server chat message
    ServerMessage = 35,
    /// Item list from the map
    ItemList = 36,
    /// Other clients' state for a joining client
    Resume = 37,
    /// Edit mode toggle
    EditMode = 38,
    /// Entity edit
    EditEntity = 39,
    /// Face edit
    EditFace = 40,
    /// Texture edit
    EditTexture = 41,
    /// Material edit
    EditMaterial = 42,
    /// Flip
    Flip = 43,
    /// Copy
    Copy = 44,
    /// Paste
    Paste = 45,
    /// Rotate
    Rotate = 46,
    /// Replace
    Replace = 47,
    /// Delete cube
    DeleteCube = 48,
    /// Remip
    Remip = 49,
    /// Edit vslot
    EditVSlot = 50,
    /// Undo
    Undo = 51,
    /// Redo
    Redo = 52,
    /// New map
    NewMap = 53,
    /// Map download request
    GetMap = 54,
    /// Map upload
    SendMap = 55,
    /// Clipboard
    Clipboard = 56,
    /// Edit variable
    EditVar = 57,
    /// Master mode change
    MasterMode = 58,
    /// Kick request
    Kick = 59,
    /// Clear bans
    ClearBans = 60,
    /// Privileged users
    CurrentMaster = 61,
    /// Spectator toggle
    Spectator = 62,
    /// Claim or grant privileges
    SetMaster = 63,
    /// Team assignment
    SetTeam = 64,
    /// Capture bases
    Bases = 65,
    /// Capture base info
    BaseInfo = 66,
    /// Capture base score
    BaseScore = 67,
    /// Capture ammo replenish
    ReplenishAmmo = 68,
    /// Capture base regen
    BaseRegen = 69,
    /// Announcement
    Announce = 70,
    /// List demos
    ListDemos = 71,
    /// Demo list
    SendDemoList = 72,
    /// Demo download request
    GetDemo = 73,
    /// Demo download
    SendDemo = 74,
    /// Demo playback
    DemoPlayback = 75,
    /// Demo recording toggle
    RecordDemo = 76,
    /// Stop demo
    StopDemo = 77,
    /// Clear demos
    ClearDemos = 78,
    /// Flag taken
    TakeFlag = 79,
    /// Flag returned
    ReturnFlag = 80,
    /// Flag reset
    ResetFlag = 81,
    /// Flag invisible
    InvisibleFlag = 82,
    /// Flag drop request
    TryDropFlag = 83,
    /// Flag dropped
    DropFlag = 84,
    /// Flag scored
    ScoreFlag = 85,
    /// Flag layout
    InitFlags = 86,
    /// Team chat
    TeamChatMessage = 87,
    /// Batched messages from one client
    Client = 88,
    /// Auth request
    AuthTry = 89,
    /// Auth kick
    AuthKick = 90,
    /// Auth challenge
    AuthChallenge = 91,
    /// Auth answer
    AuthAnswer = 92,
    /// Auth requested by server
    RequestAuth = 93,
    /// Pause toggle
    PauseGame = 94,
    /// Game speed
    GameSpeed = 95,
    /// Add bot
    AddBot = 96,
    /// Delete bot
    DeleteBot = 97,
    /// Initialize bot
    InitAi = 98,
    /// Message from a bot
    FromAi = 99,
    /// Bot limit
    BotLimit = 100,
    /// Bot balance
    BotBalance = 101,
    /// Map checksum
    MapCrc = 102,
    /// Check maps
    CheckMaps = 103,
    /// Rename
    SwitchName = 104,
    /// Model change
    SwitchModel = 105,
    /// Team change request
    SwitchTeam = 106,
    /// Collect tokens
    InitTokens = 107,
    /// Take token
    TakeToken = 108,
    /// Expire tokens
    ExpireTokens = 109,
    /// Drop tokens
    DropTokens = 110,
    /// Deposit tokens
    DepositTokens = 111,
    /// Steal tokens
    StealTokens = 112,
    /// Server command
    ServerCommand = 113,
    /// Demo packet
    DemoPacket = 114,
}

impl Msg {
    /// Wire code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Messages only the server may send.
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            Msg::ServerInfo
                | Msg::Welcome
                | Msg::InitializeClient
                | Msg::Leave
                | Msg::Died
                | Msg::Damage
                | Msg::HitPush
                | Msg::ShotEffects
                | Msg::ExplodeEffects
                | Msg::SpawnState
                | Msg::ForceDeath
                | Msg::TeamInfo
                | Msg::ItemAccepted
                | Msg::ItemSpawn
                | Msg::TimeLeft
                | Msg::Resume
                | Msg::ServerMessage
                | Msg::CurrentMaster
                | Msg::Pong
                | Msg::BaseScore
                | Msg::BaseInfo
                | Msg::BaseRegen
                | Msg::Announce
                | Msg::SendDemoList
                | Msg::SendDemo
                | Msg::DemoPlayback
                | Msg::SendMap
                | Msg::DropFlag
                | Msg::ScoreFlag
                | Msg::ReturnFlag
                | Msg::ResetFlag
                | Msg::InvisibleFlag
                | Msg::Client
                | Msg::AuthChallenge
                | Msg::InitAi
                | Msg::ExpireTokens
                | Msg::DropTokens
                | Msg::StealTokens
                | Msg::DemoPacket
        )
    }

    /// True if a client in the given join state may send this message.
    pub fn permitted(self, joined: bool) -> bool {
        if self.is_server_only() {
            return false;
        }
        if joined {
            self != Msg::Join
        } else {
            matches!(self, Msg::Join | Msg::AuthAnswer | Msg::Ping)
        }
    }
}

impl From<Msg> for i32 {
    fn from(m: Msg) -> i32 {
        m.code()
    }
}

// =============================================================================
// DISCONNECT REASONS
// =============================================================================

/// Why a client was disconnected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Normal leave
    None = 0,
    /// Packet ended unexpectedly
    EndOfPacket = 1,
    /// Local mode
    Local = 2,
    /// Kicked or banned
    Kick = 3,
    /// Malformed or disallowed message
    MessageError = 4,
    /// Address is banned
    IpBanned = 5,
    /// Private master mode
    PrivateMode = 6,
    /// No free slots
    Full = 7,
    /// Timed out
    Timeout = 8,
    /// Send buffer overflow
    Overflow = 9,
    /// Wrong password
    Password = 10,
}

impl DisconnectReason {
    /// Wire code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Text shown to other players.
    pub fn message(self) -> &'static str {
        match self {
            DisconnectReason::None => "",
            DisconnectReason::EndOfPacket => "end of packet",
            DisconnectReason::Local => "server is in local mode",
            DisconnectReason::Kick => "kicked/banned",
            DisconnectReason::MessageError => "message error",
            DisconnectReason::IpBanned => "ip is banned",
            DisconnectReason::PrivateMode => "server is in private mode",
            DisconnectReason::Full => "server full",
            DisconnectReason::Timeout => "connection timed out",
            DisconnectReason::Overflow => "overflow",
            DisconnectReason::Password => "invalid password",
        }
    }
}

// =============================================================================
// ROLES AND MASTER MODES
// =============================================================================

/// Privilege level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
#[derive(Default)]
pub enum Role {
    /// No privileges
    #[default]
    None = 0,
    /// Claimed master
    Master = 1,
    /// Authenticated master
    Auth = 2,
    /// Administrator
    Admin = 3,
}

impl Role {
    /// Wire code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Master => "master",
            Role::Auth => "auth",
            Role::Admin => "admin",
        }
    }

    /// True for any elevated role.
    #[inline]
    pub fn is_privileged(self) -> bool {
        self > Role::None
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Role::None),
            "master" => Ok(Role::Master),
            "auth" => Ok(Role::Auth),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Server access policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub enum MasterMode {
    /// Anyone may join; authenticated users may claim master
    Auth,
    /// Anyone may join and claim master
    #[default]
    Open,
    /// Map votes need approval
    Veto,
    /// New players join as spectators
    Locked,
    /// Nobody may join
    Private,
}

impl MasterMode {
    /// Wire code.
    pub fn code(self) -> i32 {
        match self {
            MasterMode::Auth => -1,
            MasterMode::Open => 0,
            MasterMode::Veto => 1,
            MasterMode::Locked => 2,
            MasterMode::Private => 3,
        }
    }

    /// Look up by wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(MasterMode::Auth),
            0 => Some(MasterMode::Open),
            1 => Some(MasterMode::Veto),
            2 => Some(MasterMode::Locked),
            3 => Some(MasterMode::Private),
            _ => None,
        }
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            MasterMode::Auth => "auth",
            MasterMode::Open => "open",
            MasterMode::Veto => "veto",
            MasterMode::Locked => "locked",
            MasterMode::Private => "private",
        }
    }
}

// =============================================================================
// TEXT
// =============================================================================

/// Cube colour escapes used in server messages.
pub mod color {
    /// Green
    pub const GREEN: &str = "\u{c}0";
    /// Blue
    pub const BLUE: &str = "\u{c}1";
    /// Yellow
    pub const YELLOW: &str = "\u{c}2";
    /// Red
    pub const RED: &str = "\u{c}3";
    /// Gray
    pub const GRAY: &str = "\u{c}4";
    /// Magenta
    pub const MAGENTA: &str = "\u{c}5";
    /// Orange
    pub const ORANGE: &str = "\u{c}6";
    /// White
    pub const WHITE: &str = "\u{c}7";
    /// Save the current colour
    pub const SAVE: &str = "\u{c}s";
    /// Restore the saved colour
    pub const RESTORE: &str = "\u{c}r";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in 0..=114 {
            let msg = Msg::from_code(code).unwrap();
            assert_eq!(msg.code(), code);
        }
        assert_eq!(Msg::from_code(115), None);
        assert_eq!(Msg::from_code(-1), None);
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(Msg::Position.code(), 4);
        assert_eq!(Msg::MasterMode.code(), 58);
        assert_eq!(Msg::TakeFlag.code(), 79);
        assert_eq!(Msg::Client.code(), 88);
        assert_eq!(Msg::PauseGame.code(), 94);
        assert_eq!(Msg::MapCrc.code(), 102);
    }

    #[test]
    fn test_permitted_before_join() {
        assert!(Msg::Join.permitted(false));
        assert!(Msg::AuthAnswer.permitted(false));
        assert!(Msg::Ping.permitted(false));
        assert!(!Msg::ChatMessage.permitted(false));
        assert!(!Msg::Position.permitted(false));
    }

    #[test]
    fn test_permitted_after_join() {
        assert!(!Msg::Join.permitted(true));
        assert!(Msg::ChatMessage.permitted(true));
        assert!(Msg::AuthTry.permitted(true));
        assert!(!Msg::Damage.permitted(true));
        assert!(!Msg::ScoreFlag.permitted(true));
        assert!(!Msg::Client.permitted(true));
    }

    #[test]
    fn test_roles() {
        assert!(Role::Admin > Role::Auth);
        assert!(Role::Auth > Role::Master);
        assert!(!Role::None.is_privileged());
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_master_modes() {
        for mm in [
            MasterMode::Auth,
            MasterMode::Open,
            MasterMode::Veto,
            MasterMode::Locked,
            MasterMode::Private,
        ] {
            assert_eq!(MasterMode::from_code(mm.code()), Some(mm));
        }
        assert!(MasterMode::Private > MasterMode::Locked);
    }

    #[test]
    fn test_disconnect_messages() {
        assert_eq!(DisconnectReason::IpBanned.message(), "ip is banned");
        assert_eq!(DisconnectReason::MessageError.code(), 4);
    }
}
