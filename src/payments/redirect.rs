use async_trait::async_trait;

use super::{CheckoutHandle, CheckoutRequest, CheckoutTarget, Gateway, GatewayError, PaymentGateway};

/// Hotmart and Kiwify: a static per-course URL, no webhooks, no status API.
/// Orders on these gateways settle only through manual confirmation.
#[derive(Debug, Clone, Copy)]
pub struct RedirectGateway {
    gateway: Gateway,
}

impl RedirectGateway {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl PaymentGateway for RedirectGateway {
    fn gateway(&self) -> Gateway {
        self.gateway
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutHandle, GatewayError> {
        let url = request
            .course
            .external_checkout_url(self.gateway)
            .ok_or_else(|| {
                GatewayError::Misconfigured(format!(
                    "Course {} has no {} checkout URL",
                    request.course.id, self.gateway
                ))
            })?;

        Ok(CheckoutHandle {
            target: CheckoutTarget::Url(url.to_string()),
            external_reference: None,
        })
    }
}
