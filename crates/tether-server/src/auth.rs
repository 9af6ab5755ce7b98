//! Caller authentication ahead of completion requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::json;
use tether_telemetry::LogContext;
use tether_upstream::CompletionGateway;
use tracing::Span;

pub const WALLET_AUTH_METHOD: &str = "walletAuth/authenticateWallet";

/// Decides whether a caller identity may use the completion endpoint.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn authenticate(&self, identity: &str) -> bool;
}

/// Accepts every identity. Local use and tests.
pub struct AllowAll;

#[async_trait]
impl AuthGate for AllowAll {
    async fn authenticate(&self, _identity: &str) -> bool {
        true
    }
}

/// Authenticates wallet addresses against the upstream over the shared
/// connection. Successful wallets are remembered for the process lifetime.
pub struct WalletAuthGate {
    gateway: Arc<CompletionGateway>,
    timeout: Duration,
    authenticated: DashSet<String>,
    span: Span,
}

impl WalletAuthGate {
    pub fn new(gateway: Arc<CompletionGateway>, timeout: Duration, log: &LogContext) -> Self {
        Self {
            gateway,
            timeout,
            authenticated: DashSet::new(),
            span: log.component("auth"),
        }
    }

    pub fn is_cached(&self, wallet: &str) -> bool {
        self.authenticated.contains(wallet)
    }
}

#[async_trait]
impl AuthGate for WalletAuthGate {
    async fn authenticate(&self, wallet: &str) -> bool {
        if self.is_cached(wallet) {
            return true;
        }

        let masked = mask_wallet(wallet);
        tracing::info!(parent: &self.span, wallet = %masked, "Authenticating wallet");
        let args = json!({
            "walletAddress": wallet,
            "referred_by_id": "",
            "telegramId": null,
        });

        match self.gateway.call(WALLET_AUTH_METHOD, args, self.timeout).await {
            Ok(reply) if reply.is_success() => {
                self.authenticated.insert(wallet.to_string());
                tracing::info!(parent: &self.span, wallet = %masked, "Wallet authenticated");
                true
            }
            Ok(reply) => {
                tracing::error!(
                    parent: &self.span,
                    wallet = %masked,
                    status = ?reply.status_code,
                    message = %reply.payload,
                    "Wallet authentication rejected"
                );
                false
            }
            Err(e) => {
                tracing::error!(parent: &self.span, wallet = %masked, error = %e, kind = e.error_kind(), "Wallet authentication failed");
                false
            }
        }
    }
}

/// `0x1234...cdef` style rendering for logs.
pub fn mask_wallet(wallet: &str) -> String {
    let chars: Vec<char> = wallet.chars().collect();
    if chars.len() <= 10 {
        return wallet.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
