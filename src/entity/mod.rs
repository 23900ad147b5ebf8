pub mod addresses;
pub mod audit_logs;
pub mod coupons;
pub mod inventory;
pub mod order_items;
pub mod order_summaries;
pub mod orders;
pub mod products;
pub mod purchase_events;
pub mod users;

pub use addresses::Entity as Addresses;
pub use audit_logs::Entity as AuditLogs;
pub use coupons::Entity as Coupons;
pub use inventory::Entity as Inventory;
pub use order_items::Entity as OrderItems;
pub use order_summaries::Entity as OrderSummaries;
pub use orders::Entity as Orders;
pub use products::Entity as Products;
pub use purchase_events::Entity as PurchaseEvents;
pub use users::Entity as Users;
