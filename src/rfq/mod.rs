//! Request-for-quote: the `rfq` command channel, quote sessions and the
//! price provider they poll.

mod channel;
mod price;
mod quote;
mod session;

pub use channel::RfqChannel;
pub use price::{price_from_body, CryptoCompareClient, PriceError, PriceProvider};
pub use quote::{format_fixed, parse_amount, Quote, QuoteRequest};
pub use session::{QuoteSession, SessionConfig, SessionEvent, SessionKey, SessionPhase};

/// Envelope key of the RFQ channel
pub const RFQ_CHANNEL: &str = "rfq";
