// 行情数据管线：流客户端、tick聚合、秒级合成
pub mod aggregator;
pub mod composer;
pub mod streamer;

pub use aggregator::TickAggregator;
pub use composer::{compose_second, micro_momentum, ComposeInputs, SentimentComposer};
pub use streamer::{ReconnectPolicy, TickStreamClient, TickStreamConfig};
