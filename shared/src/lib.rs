pub mod channel;
pub mod messages;
pub mod reservation;

pub use channel::{
    ChannelClient, ChannelError, ConsumerLoop, Delivery, HandlerOutcome, InMemoryBroker,
    MessageHandler, Subscription,
};
pub use messages::{
    dead_letter_topic, DeadLetter, ReconciliationAlert, SettlementEvent, RECONCILE_TOPIC,
    SETTLEMENT_TOPIC,
};
pub use reservation::{
    ReservationApi, ReservationGrant, ReserveError, ReserveRequest,
};
