//! defindex-evm: EVM log source, protocol decoders, decode pipeline and the
//! reorg-aware index loop.

pub mod abi;
pub mod builder;
pub mod decoder;
pub mod fetcher;
pub mod index_loop;
pub mod pipeline;
pub mod retry;
pub mod source;

pub use builder::IndexerBuilder;
pub use decoder::{DecoderSet, ProtocolDecoder, ProtocolsConfig, TokenInfo};
pub use fetcher::{LogFetcher, LogSource, RawLog};
pub use index_loop::{IndexLoop, IndexLoopEvent, LoopStats};
pub use pipeline::{DecodePipeline, DecodeWarning, DecodedBatch};
pub use retry::RetryPolicy;
pub use source::{ChainFixture, MemoryChain};
