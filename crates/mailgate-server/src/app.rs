use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::rest::TicketingClient;

#[derive(Clone)]
pub struct AppState {
    pub ticketing: Arc<dyn TicketingClient>,
    pub shutdown: CancellationToken,
}
