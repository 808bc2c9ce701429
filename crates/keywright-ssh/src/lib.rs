pub mod process;
pub mod validator;

pub use process::{ProcessError, ProcessInvoker, ProcessOutput, SystemProcess};
pub use validator::{CommandValidator, Handshake, TransportValidator};
