mod course;
mod enrollment;
mod external_checkout;
mod payment_order;
mod webhook_event;

pub use course::*;
pub use enrollment::*;
pub use external_checkout::*;
pub use payment_order::*;
pub use webhook_event::*;
