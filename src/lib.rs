pub mod error;
pub mod source;
pub mod record;
pub mod tree;
pub mod verify;
pub mod buffer;
pub mod compact;
pub mod codec;
pub mod resolve;
pub mod writer;
pub mod manifest;

pub use error::{Error, Result};
pub use source::ByteSource;
pub use record::{Digest, Record, Tag};
pub use tree::{Node, Tree};
pub use verify::{verify, VerifyMode, VerifyOptions, VerifyReport};
pub use compact::{compact, compact_to_path, plan, CompactOptions, CompactStats};
pub use codec::{get_codec, CodecId};
pub use resolve::{sniff, ContentResolver, Encoding, ExtractOptions, ExtractStats, Extractor};
pub use writer::{pack_directory, ContainerWriter, PackOptions};
pub use manifest::Manifest;
