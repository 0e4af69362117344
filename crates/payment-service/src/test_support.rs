//! 单元测试共用的 mock

use async_trait::async_trait;
use payment_shared::error::Result;
use payment_shared::events::PaymentEvent;
use payment_shared::kafka::EventPublisher;

mockall::mock! {
    pub Publisher {}

    #[async_trait]
    impl EventPublisher for Publisher {
        async fn publish(&self, topic: &str, event: &PaymentEvent) -> Result<()>;
    }
}
