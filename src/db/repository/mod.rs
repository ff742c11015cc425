pub mod batch_repository;
pub mod delivery_record_repository;
pub mod inbox_repository;
pub mod metric_repository;
pub mod notification_repository;
pub mod preference_repository;
pub mod template_repository;

pub use batch_repository::BatchRepository;
pub use delivery_record_repository::DeliveryRecordRepository;
pub use inbox_repository::InboxRepository;
pub use metric_repository::{FlushPoint, Granularity, MetricRepository};
pub use notification_repository::{NotificationRepository, QueueRepository};
pub use preference_repository::PreferenceRepository;
pub use template_repository::TemplateRepository;
