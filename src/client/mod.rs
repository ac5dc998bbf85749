pub mod evm;
pub mod tron;

pub use evm::EvmLogClient;
pub use tron::TronGridClient;
