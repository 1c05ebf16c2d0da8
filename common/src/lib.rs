pub mod erc20;
pub mod error;
pub mod multicall;
pub mod token;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
