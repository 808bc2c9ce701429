pub mod agent;
pub mod keys;
pub mod seal;

pub use agent::{AgentError, AgentInterface, AgentManager, NativeAgent};
pub use keys::{
    curve_from_name, GeneratedKey, KeyAlgorithm, KeyGenerator, KeygenError, NativeKeyGenerator,
};
pub use seal::{DocumentSeal, SealError};
