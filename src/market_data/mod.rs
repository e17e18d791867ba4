pub mod candle_buffer;
pub mod feed;
pub mod orderbook;

pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use feed::MarketDataFeed;
pub use orderbook::{Depth, OrderBookManager};
