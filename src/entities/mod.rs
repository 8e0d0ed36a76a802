// Entity Models
// "Identity persists, values change"
//
// A security keeps its code forever; names and classification are refreshed
// in place from each universe listing, and harvest cursors track freshness.

pub mod security;

pub use security::{
    Cursor, ListingOutcome, Security, SecurityCode, SecurityRegistry, SecurityUpdate,
    MARKET_SUFFIX,
};
