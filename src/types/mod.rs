pub mod account;
pub mod candle;
pub mod component;
pub mod opportunity;
pub mod position;
pub mod trading;

pub use account::*;
pub use candle::*;
pub use component::*;
pub use opportunity::*;
pub use position::*;
pub use trading::*;
