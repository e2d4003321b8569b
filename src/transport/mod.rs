pub mod events;

pub use events::{EventPublisher, OrderEvent, OrderEventBus};
