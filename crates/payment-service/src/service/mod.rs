//! 服务层
//!
//! - `payment_service`: 支付生命周期服务（创建、取消、查询）

pub mod payment_service;

pub use payment_service::PaymentService;
