mod debounce;
mod draft;
mod gateway;
mod identity;
mod session;
mod stats;
mod status;
mod version;

pub use debounce::Debouncer;
pub use draft::{DeleteTicket, Draft, DraftError, SaveAck, SaveRequest, SaveTicket};
pub use gateway::{
    AuthSession, EntryFields, EntryGateway, EntryId, GatewayError, OwnerRef, StaticSession,
    Visibility,
};
pub use identity::{IdentityResolver, Resolution};
pub use session::DraftSession;
pub use stats::DerivedStats;
pub use status::{DraftEvent, SaveStatus, StatusPublisher};
pub use version::{SaveStamp, VersionGuard};
