pub mod candle_store;
pub mod session;
pub mod validator;

pub use candle_store::MemoryCandleStore;
pub use session::{SessionConfig, SessionFilter};
