pub mod chain;
pub mod live;
pub mod normalizer;
pub mod planner;
pub mod source;
pub mod types;
