pub mod candle_buffer;
pub mod trade_stream;

pub use candle_buffer::{bybit_interval_code, Candle, CandleBuffer, CandleKey};
pub use trade_stream::TickEvent;
