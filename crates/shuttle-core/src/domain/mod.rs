//! Domain model (ids, messages, queue policy, state machines, errors).

pub mod errors;
pub mod ids;
pub mod message;
pub mod policy;
pub mod state;

pub use self::errors::{
    BrokerError, HandlerError, NonceError, ProcessingError, ShuttleError, WorkerFailure,
    WorkerThreadError,
};
pub use self::ids::{MessageId, Receipt};
pub use self::message::{Delivery, Message, MessageArgs, MessageContext};
pub use self::policy::{BackoffMode, QueuePolicy, WEIGHT_SCALE};
pub use self::state::{Resolution, SupervisorState};
