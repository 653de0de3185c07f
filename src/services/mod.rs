pub mod encoder;
pub mod engine;
pub mod export;
pub mod pipeline;
pub mod transport;
pub mod validation;
