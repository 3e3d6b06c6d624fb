use async_trait::async_trait;
use camp_core::{InstructionType, ReplyPayload};

use super::{Executor, ExecutorError};

/// Resolves a host name through the system resolver.
pub struct DnsExecutor;

#[async_trait]
impl Executor for DnsExecutor {
    fn kind(&self) -> InstructionType {
        InstructionType::Dns
    }

    async fn execute(&self, content: &str) -> Result<ReplyPayload, ExecutorError> {
        let domain = content.trim();
        if domain.is_empty() {
            return Err(ExecutorError::Failed("empty domain".to_string()));
        }
        let mut addrs: Vec<String> = Vec::new();
        for addr in tokio::net::lookup_host((domain, 0)).await? {
            let ip = addr.ip().to_string();
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
        if addrs.is_empty() {
            return Err(ExecutorError::Failed(format!("no addresses for {domain}")));
        }
        Ok(ReplyPayload::Dns(addrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn resolves_localhost() {
        let ReplyPayload::Dns(addrs) = DnsExecutor.execute("localhost").await.unwrap() else {
            panic!("expected a dns reply");
        };
        assert!(addrs.iter().any(|a| a == "127.0.0.1" || a == "::1"), "{addrs:?}");
    }

    #[test_timeout::tokio_timeout_test]
    async fn blank_domain_fails() {
        assert!(DnsExecutor.execute("   ").await.is_err());
    }
}
