use orbroker_contracts::{Credentials, ModelInfo, ModelsResponse};
use orbroker_core::{BrokerError, HttpTransport};
use tracing::info;

use crate::get_json;

/// The catalog is public; the bearer token is sent only when one is set.
pub async fn list_models(
    transport: &dyn HttpTransport,
    api_base: &str,
    credentials: &Credentials,
) -> Result<Vec<ModelInfo>, BrokerError> {
    let url = format!("{}/models", api_base.trim().trim_end_matches('/'));
    let catalog: ModelsResponse = get_json(transport, &url, credentials.api_key.trim()).await?;
    info!(event = "models.listed", count = catalog.data.len());
    Ok(catalog.data)
}
