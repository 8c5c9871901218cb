/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/courier/1.0.0";

/// Application name
pub const APP_NAME: &str = "Courier";

/// First path segment of every direct-message topic.
///
/// Topics are written with a leading slash, `/courier/1/dm-<low>-<high>/proto`,
/// and the slash is part of the wire name: peers that omit it land on a
/// different GossipSub topic and never see each other's messages.
pub const TOPIC_NAMESPACE: &str = "courier";

/// Topic layout version. Bump when the topic format changes.
pub const TOPIC_VERSION: &str = "1";

/// Trailing topic segment naming the payload encoding
pub const TOPIC_ENCODING: &str = "proto";

/// Prefix of the pair segment inside a topic
pub const DM_SEGMENT_PREFIX: &str = "dm-";

/// Longest accepted account address, in characters
pub const MAX_ADDRESS_LEN: usize = 128;

/// Length of the random suffix appended to generated message ids
pub const MESSAGE_ID_SUFFIX_LEN: usize = 8;

/// Maximum message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Shown in place of a counterpart's display name when none is known
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Default upper bound on bootstrap + peer wait, in seconds
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 30;

/// Key derivation context for the libp2p node identity (BLAKE3)
pub const KDF_CONTEXT_NODE_KEY: &str = "courier-libp2p-keypair-v1";
