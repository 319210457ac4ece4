use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::cache::lock;
use crate::error::EngineError;

/// Runs a source call with an upper bound on its duration.
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(EngineError::Timeout(limit)))
}

/// Records currently being mutated. A record can be claimed by one
/// operation at a time.
#[derive(Debug, Default)]
pub struct SubmitClaims {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl SubmitClaims {
    /// Claims all of `ids` or none of them.
    pub fn claim(&self, ids: &[Uuid]) -> Result<SubmitGuard, EngineError> {
        let mut held = lock(&self.held);
        if let Some(busy) = ids.iter().find(|id| held.contains(id)) {
            return Err(EngineError::Busy(format!("record {busy} is already being processed")));
        }
        held.extend(ids.iter().copied());
        Ok(SubmitGuard {
            held: Arc::clone(&self.held),
            ids: ids.to_vec(),
        })
    }

    pub fn is_held(&self, id: Uuid) -> bool {
        lock(&self.held).contains(&id)
    }

    pub fn any_held(&self) -> bool {
        !lock(&self.held).is_empty()
    }
}

#[derive(Debug)]
pub struct SubmitGuard {
    held: Arc<Mutex<HashSet<Uuid>>>,
    ids: Vec<Uuid>,
}

impl Drop for SubmitGuard {
    fn drop(&mut self) {
        let mut held = lock(&self.held);
        for id in &self.ids {
            held.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_exclusive_until_released() {
        let claims = SubmitClaims::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let guard = claims.claim(&[a]).unwrap();
        assert!(matches!(claims.claim(&[b, a]), Err(EngineError::Busy(_))));
        assert!(!claims.is_held(b));

        drop(guard);
        assert!(!claims.any_held());
        assert!(claims.claim(&[a, b]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let limit = Duration::from_secs(10);
        let result: Result<(), EngineError> = with_timeout(limit, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(EngineError::Timeout(limit)));

        let fast = with_timeout(limit, async { Ok::<_, EngineError>(5) }).await;
        assert_eq!(fast, Ok(5));
    }
}
