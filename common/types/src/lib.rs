mod event;
mod seller;
pub mod topology;

// Events
pub use event::SellerCreatedEvent;

// Sellers
pub use seller::Seller;
pub use seller::ValidationError;
