use std::time::Duration;

use async_trait::async_trait;
use camp_core::{HttpInspection, InstructionType, ReplyPayload};

use super::{Executor, ExecutorError};

/// Bodies beyond this are truncated in the reply.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Plain GET of the instruction URL.
pub struct HttpExecutor {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn kind(&self) -> InstructionType {
        InstructionType::Http
    }

    async fn execute(&self, content: &str) -> Result<ReplyPayload, ExecutorError> {
        let url = content.trim();
        let mut response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                ExecutorError::TimedOut(self.timeout)
            } else {
                ExecutorError::Http(err)
            }
        })?;
        let status_code = response.status().as_u16();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_BODY_BYTES - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_BODY_BYTES {
                break;
            }
        }

        Ok(ReplyPayload::Http(HttpInspection {
            url: url.to_string(),
            status_code,
            response: body,
        }))
    }
}
