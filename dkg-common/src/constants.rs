/// Magic number used to identify valid DKG protocol datagrams.
pub const DKG_MAGIC: u32 = 0x0d6b_0001;

/// Default UDP port used for protocol communication between nodes.
pub const DKG_UDP_PORT: u16 = 9000;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Maximum number of concurrently open inbound sessions before a node answers BUSY.
pub const MAX_OPEN_SESSIONS: usize = 10;

/// Network protocol identifiers, one per operation kind.
pub const STORE_PROTOCOL: &str = "/store/1.0.0";
pub const UPDATE_PROTOCOL: &str = "/update/1.0.0";
pub const GET_PROTOCOL: &str = "/get/1.0.0";
pub const SEARCH_PROTOCOL: &str = "/search/1.0.0";

/// Default per-phase message timeouts in milliseconds.
pub const INIT_TIMEOUT_MS: u64 = 15_000;
pub const REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Hash function id advertised in INIT payloads (SHA-256).
pub const DEFAULT_HASH_FUNCTION_ID: u8 = 1;
