use anyhow::{Context, Result};
use ck_api_types::{ChainId, WalletId};
use ck_connectors::ConnectParams;
use tracing::{debug, info, warn};

use crate::{AccountSnapshot, ConnectionSession, WalletRegistry};

/// Restores the last connected wallet without prompting the user.
///
/// The stored wallet is reconnected only if its connector says the app is
/// still authorized. Otherwise, or if the silent connect fails, the stored
/// record is cleared and `None` is returned.
pub async fn auto_connect(registry: &WalletRegistry, session: &ConnectionSession) -> Result<Option<AccountSnapshot>> {
    let record = session
        .store()
        .load_last_connected()
        .await
        .context("failed to load last connected wallet")?;
    let Some(record) = record else {
        debug!("no wallet to restore");
        return Ok(None);
    };

    let wallet_id = WalletId(record.wallet_id);
    let connector = match registry.connector(&wallet_id) {
        Ok(connector) => connector,
        Err(err) => {
            warn!(wallet = %wallet_id, error = %err, "stored wallet is no longer offered");
            return forget(session).await;
        }
    };

    if !connector.is_authorized().await {
        debug!(wallet = %wallet_id, "stored wallet is not authorized anymore");
        return forget(session).await;
    }

    let params = ConnectParams::silent().with_chain(ChainId(record.chain_id));
    if let Err(err) = connector.connect(params).await {
        warn!(wallet = %wallet_id, error = %err, "silent reconnect failed");
        return forget(session).await;
    }

    let snapshot = session
        .activate(wallet_id.clone(), connector)
        .await
        .with_context(|| format!("failed to activate restored wallet {wallet_id}"))?;
    info!(wallet = %wallet_id, address = %snapshot.address, "previous wallet restored");
    Ok(Some(snapshot))
}

async fn forget(session: &ConnectionSession) -> Result<Option<AccountSnapshot>> {
    session
        .store()
        .clear_last_connected()
        .await
        .context("failed to clear last connected wallet")?;
    Ok(None)
}
