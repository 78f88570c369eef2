//! Single-flight credential refresh.
//!
//! When several requests fail with 401 at once, exactly one of them (the
//! leader) calls the refresh endpoint. The others queue behind it and resume
//! with the new access token, or fail together if the refresh fails. A
//! request is retried at most once; a second 401 or a failed refresh signs the
//! user out by clearing the credential store, which also stops the transport.

use crate::credentials::CredentialStore;
use crate::error::{ClientError, ClientResult};
use crate::http::{ApiRequest, ApiResponse, HttpClient, TokenRefresher};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tasksync_protocol::AuthTokens;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<String, String>>;

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<Waiter>,
}

enum Role {
    Current(String),
    Waiter(oneshot::Receiver<Result<String, String>>),
    Leader(String),
}

/// Coordinates credential refreshes for the whole process.
pub struct RefreshCoordinator {
    credentials: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<RefreshState>,
    refreshes: AtomicU64,
}

impl RefreshCoordinator {
    /// Creates a coordinator over a credential store.
    pub fn new(credentials: CredentialStore, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            credentials,
            refresher,
            state: Mutex::new(RefreshState::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Returns true while a refresh call is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().refreshing
    }

    /// Returns how many refresh calls have been made.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Returns an access token that supersedes `rejected`.
    ///
    /// If the current token already differs from `rejected`, a refresh has
    /// happened since the request was sent and the current token is returned
    /// as-is. If a refresh is in flight the caller waits for its outcome.
    /// Otherwise the caller performs the refresh.
    pub async fn refreshed_token(&self, rejected: &str) -> ClientResult<String> {
        let role = {
            let mut state = self.state.lock();
            if state.refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Role::Waiter(rx)
            } else {
                match self.credentials.get() {
                    None => return Err(ClientError::NotSignedIn),
                    Some(tokens) if tokens.access_token != rejected => {
                        Role::Current(tokens.access_token)
                    }
                    Some(tokens) => {
                        state.refreshing = true;
                        Role::Leader(tokens.refresh_token)
                    }
                }
            }
        };

        match role {
            Role::Current(token) => {
                debug!("credential already rotated, retrying with current token");
                Ok(token)
            }
            Role::Waiter(rx) => match rx.await {
                Ok(Ok(token)) => Ok(token),
                Ok(Err(reason)) => Err(ClientError::SessionExpired(reason)),
                Err(_) => Err(ClientError::SessionExpired("refresh abandoned".into())),
            },
            Role::Leader(refresh_token) => self.lead(refresh_token).await,
        }
    }

    async fn lead(&self, refresh_token: String) -> ClientResult<String> {
        let mut guard = LeaderGuard {
            coordinator: self,
            finished: false,
        };
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        debug!("refreshing credential");

        let outcome = self.refresher.refresh(&refresh_token).await;
        guard.finished = true;

        match outcome {
            Ok(tokens) => {
                let access = tokens.access_token.clone();
                self.finish(Ok(tokens.access_token.clone()), Some(tokens));
                info!("credential refreshed");
                Ok(access)
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed, signing out");
                self.finish(Err(e.to_string()), None);
                self.credentials.clear();
                Err(ClientError::SessionExpired(e.to_string()))
            }
        }
    }

    /// Publishes the outcome and releases every waiter. The new pair is stored
    /// before the refreshing flag drops, so no caller can observe the flag
    /// cleared with the old token still current.
    fn finish(&self, outcome: Result<String, String>, tokens: Option<AuthTokens>) {
        let waiters = {
            let mut state = self.state.lock();
            if let Some(tokens) = tokens {
                self.credentials.set(tokens);
            }
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Releases the queue if the leader's future is dropped mid-refresh.
struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    finished: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("credential refresh cancelled");
            self.coordinator
                .finish(Err("refresh cancelled".into()), None);
        }
    }
}

/// An HTTP client that attaches the current access token and recovers from
/// expired credentials.
pub struct AuthorizedClient<C: HttpClient> {
    http: Arc<C>,
    credentials: CredentialStore,
    coordinator: Arc<RefreshCoordinator>,
}

impl<C: HttpClient> AuthorizedClient<C> {
    /// Creates an authorized client.
    pub fn new(
        http: Arc<C>,
        credentials: CredentialStore,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http,
            credentials,
            coordinator,
        }
    }

    /// Returns the credential store.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Returns the refresh coordinator.
    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Returns the underlying HTTP client.
    pub fn http(&self) -> &Arc<C> {
        &self.http
    }

    /// Sends a request with the current credential, refreshing and retrying
    /// once on 401.
    pub async fn send(&self, request: &ApiRequest) -> ClientResult<ApiResponse> {
        let token = self
            .credentials
            .access_token()
            .ok_or(ClientError::NotSignedIn)?;
        let response = self.http.execute(request, Some(&token)).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let token = self.coordinator.refreshed_token(&token).await?;
        let retried = self.http.execute(request, Some(&token)).await?;
        if retried.is_unauthorized() {
            warn!(path = %request.path, "request rejected after refresh, signing out");
            self.credentials.clear();
            return Err(ClientError::SessionExpired(
                "credential rejected after refresh".into(),
            ));
        }
        Ok(retried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::future::join_all;
    use std::time::Duration;

    fn pair(n: u32) -> AuthTokens {
        AuthTokens {
            access_token: format!("access-{n}"),
            refresh_token: format!("refresh-{n}"),
            expires_at: Utc::now(),
        }
    }

    /// Rotates `refresh-N` into pair N+1 after a delay.
    struct FakeRefresher {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, refresh_token: &str) -> ClientResult<AuthTokens> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ClientError::SessionExpired("refresh token revoked".into()));
            }
            let n: u32 = refresh_token
                .trim_start_matches("refresh-")
                .parse()
                .unwrap();
            Ok(pair(n + 1))
        }
    }

    /// Accepts exactly one access token.
    struct FakeServer {
        valid: Mutex<String>,
    }

    #[async_trait]
    impl HttpClient for FakeServer {
        async fn execute(
            &self,
            _request: &ApiRequest,
            access_token: Option<&str>,
        ) -> ClientResult<ApiResponse> {
            let status = if access_token == Some(self.valid.lock().as_str()) {
                200
            } else {
                401
            };
            Ok(ApiResponse {
                status,
                body: b"{}".to_vec(),
            })
        }
    }

    fn setup(
        initial: u32,
        valid: &str,
        refresher: FakeRefresher,
    ) -> (AuthorizedClient<FakeServer>, CredentialStore) {
        let credentials = CredentialStore::new(Some(pair(initial)));
        let coordinator = Arc::new(RefreshCoordinator::new(
            credentials.clone(),
            Arc::new(refresher),
        ));
        let server = Arc::new(FakeServer {
            valid: Mutex::new(valid.into()),
        });
        (
            AuthorizedClient::new(server, credentials.clone(), coordinator),
            credentials,
        )
    }

    fn request() -> ApiRequest {
        ApiRequest::new(Method::Get, "/api/tasks")
    }

    #[tokio::test]
    async fn concurrent_unauthorized_requests_share_one_refresh() {
        let (client, credentials) = setup(
            1,
            "access-2",
            FakeRefresher {
                delay: Duration::from_millis(50),
                fail: false,
            },
        );

        let request = request();
        let results = join_all((0..5).map(|_| client.send(&request))).await;

        assert!(results.iter().all(|r| matches!(r, Ok(resp) if resp.status == 200)));
        assert_eq!(client.coordinator().refresh_count(), 1);
        assert_eq!(credentials.access_token().as_deref(), Some("access-2"));
        assert_eq!(credentials.refresh_token().as_deref(), Some("refresh-2"));
        assert!(!client.coordinator().is_refreshing());
    }

    #[tokio::test]
    async fn failed_refresh_signs_out_everyone() {
        let (client, credentials) = setup(
            1,
            "access-2",
            FakeRefresher {
                delay: Duration::from_millis(20),
                fail: true,
            },
        );

        let request = request();
        let results = join_all((0..3).map(|_| client.send(&request))).await;

        assert!(results
            .iter()
            .all(|r| matches!(r, Err(ClientError::SessionExpired(_)))));
        assert_eq!(client.coordinator().refresh_count(), 1);
        assert!(credentials.get().is_none());
    }

    #[tokio::test]
    async fn second_unauthorized_signs_out() {
        // The server accepts no token at all.
        let (client, credentials) = setup(
            1,
            "nothing",
            FakeRefresher {
                delay: Duration::ZERO,
                fail: false,
            },
        );

        let result = client.send(&request()).await;
        assert!(matches!(result, Err(ClientError::SessionExpired(_))));
        assert_eq!(client.coordinator().refresh_count(), 1);
        assert!(credentials.get().is_none());
    }

    #[tokio::test]
    async fn stale_rejection_reuses_current_token() {
        let credentials = CredentialStore::new(Some(pair(2)));
        let coordinator = RefreshCoordinator::new(
            credentials,
            Arc::new(FakeRefresher {
                delay: Duration::ZERO,
                fail: false,
            }),
        );

        let token = coordinator.refreshed_token("access-1").await.unwrap();
        assert_eq!(token, "access-2");
        assert_eq!(coordinator.refresh_count(), 0);
    }

    #[tokio::test]
    async fn signed_out_request_fails_fast() {
        let credentials = CredentialStore::default();
        let coordinator = Arc::new(RefreshCoordinator::new(
            credentials.clone(),
            Arc::new(FakeRefresher {
                delay: Duration::ZERO,
                fail: false,
            }),
        ));
        let client = AuthorizedClient::new(
            Arc::new(FakeServer {
                valid: Mutex::new("x".into()),
            }),
            credentials,
            coordinator,
        );
        assert!(matches!(
            client.send(&request()).await,
            Err(ClientError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn dropped_leader_releases_waiters() {
        let credentials = CredentialStore::new(Some(pair(1)));
        let coordinator = Arc::new(RefreshCoordinator::new(
            credentials,
            Arc::new(FakeRefresher {
                delay: Duration::from_secs(60),
                fail: false,
            }),
        ));

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.refreshed_token("access-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.is_refreshing());

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.refreshed_token("access-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ClientError::SessionExpired(_))));
        assert!(!coordinator.is_refreshing());
    }
}
