pub mod inventory_service;
pub mod order_service;
pub mod webhook_service;
