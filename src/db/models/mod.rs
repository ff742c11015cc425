//! Database models split into separate files.

pub mod batch;
pub mod delivery_record;
pub mod inbox;
pub mod metric;
pub mod notification;
pub mod preference;
pub mod template;

pub use self::batch::*;
pub use self::delivery_record::*;
pub use self::inbox::*;
pub use self::metric::*;
pub use self::notification::*;
pub use self::preference::*;
pub use self::template::*;
