use orbroker_contracts::{Balance, CreditsResponse, Credentials, KeyInfoResponse};
use orbroker_core::{BrokerError, HttpTransport};
use tracing::{Instrument, info, info_span, warn};

use crate::get_json;

/// Account credit capped by the key limit. Either lookup failing yields
/// `Unknown`, not an error.
pub async fn query_balance(
    transport: &dyn HttpTransport,
    api_base: &str,
    credentials: &Credentials,
) -> Result<Balance, BrokerError> {
    if !credentials.has_api_key() {
        return Err(BrokerError::MissingCredential);
    }
    let base = api_base.trim().trim_end_matches('/');
    let api_key = credentials.api_key.trim();
    let credits_url = format!("{base}/credits");
    let key_url = format!("{base}/key");

    async {
        let (credits, key) = tokio::join!(
            get_json::<CreditsResponse>(transport, &credits_url, api_key),
            get_json::<KeyInfoResponse>(transport, &key_url, api_key),
        );
        let balance = match (credits, key) {
            (Ok(credits), Ok(key)) => Balance::from_parts(
                credits.data.total_credits - credits.data.total_usage,
                key.data.limit_remaining,
            ),
            (credits, key) => {
                warn!(
                    event = "balance.unavailable",
                    credits_error = ?credits.err(),
                    key_error = ?key.err()
                );
                Balance::Unknown
            }
        };
        info!(event = "balance.resolved", balance = %balance);
        Ok(balance)
    }
    .instrument(info_span!("balance"))
    .await
}
