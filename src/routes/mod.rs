pub mod health;
pub mod notifications;
pub mod stats;
pub mod users;
pub mod webhooks;
