//! Typed REST endpoints.

use crate::auth::AuthorizedClient;
use crate::error::ClientResult;
use crate::http::{ApiRequest, ApiResponse, HttpClient, Method};
use async_trait::async_trait;
use tasksync_protocol::{
    AuthSession, EntityId, List, ListPatch, Login, NewList, NewSubtask, NewTask, RefreshRequest,
    Registration, Reordered, Subtask, SubtaskPatch, Task, TaskPatch, User,
};

/// The REST operations the reconciler drives.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Fetches all tasks with their subtasks.
    async fn tasks(&self) -> ClientResult<Vec<Task>>;
    /// Creates a task.
    async fn create_task(&self, new: &NewTask) -> ClientResult<Task>;
    /// Updates a task.
    async fn update_task(&self, id: EntityId, patch: &TaskPatch) -> ClientResult<Task>;
    /// Deletes a task.
    async fn delete_task(&self, id: EntityId) -> ClientResult<()>;
    /// Reorders tasks.
    async fn reorder_tasks(&self, ids: &[EntityId]) -> ClientResult<()>;

    /// Creates a subtask.
    async fn create_subtask(&self, task_id: EntityId, new: &NewSubtask) -> ClientResult<Subtask>;
    /// Updates a subtask.
    async fn update_subtask(&self, id: EntityId, patch: &SubtaskPatch) -> ClientResult<Subtask>;
    /// Deletes a subtask.
    async fn delete_subtask(&self, id: EntityId) -> ClientResult<()>;
    /// Reorders the subtasks of a task.
    async fn reorder_subtasks(&self, task_id: EntityId, ids: &[EntityId]) -> ClientResult<()>;

    /// Fetches all lists.
    async fn lists(&self) -> ClientResult<Vec<List>>;
    /// Creates a list.
    async fn create_list(&self, new: &NewList) -> ClientResult<List>;
    /// Renames a list.
    async fn update_list(&self, id: EntityId, patch: &ListPatch) -> ClientResult<List>;
    /// Deletes a list and its tasks.
    async fn delete_list(&self, id: EntityId) -> ClientResult<()>;
    /// Reorders lists.
    async fn reorder_lists(&self, ids: &[EntityId]) -> ClientResult<()>;
}

/// [`TaskApi`] over HTTP with automatic credential refresh.
pub struct RestApi<C: HttpClient> {
    client: AuthorizedClient<C>,
}

impl<C: HttpClient> RestApi<C> {
    /// Creates the API over an authorized client.
    pub fn new(client: AuthorizedClient<C>) -> Self {
        Self { client }
    }

    /// Returns the authorized client.
    pub fn client(&self) -> &AuthorizedClient<C> {
        &self.client
    }

    /// Creates an account and signs in as it.
    pub async fn register(&self, registration: &Registration) -> ClientResult<User> {
        let request = ApiRequest::new(Method::Post, "/api/auth/register").with_json(registration)?;
        self.sign_in(request).await
    }

    /// Signs in with email and password.
    pub async fn login(&self, login: &Login) -> ClientResult<User> {
        let request = ApiRequest::new(Method::Post, "/api/auth/login").with_json(login)?;
        self.sign_in(request).await
    }

    /// Fetches the signed-in user.
    pub async fn me(&self) -> ClientResult<User> {
        self.call(ApiRequest::new(Method::Get, "/api/user/me"))
            .await?
            .into_result()
    }

    /// Revokes the refresh token on the server and clears local credentials.
    ///
    /// The refresh token is the only credential sent, so logout works with an
    /// expired access token. Credentials are cleared even if the server call
    /// fails; a rejected call is still reported.
    pub async fn logout(&self) -> ClientResult<()> {
        let credentials = self.client.credentials();
        let Some(tokens) = credentials.get() else {
            return Ok(());
        };
        let request = ApiRequest::new(Method::Post, "/api/auth/logout").with_json(
            &RefreshRequest {
                refresh_token: tokens.refresh_token,
            },
        )?;
        let result = self.client.http().execute(&request, None).await;
        credentials.clear();
        result.and_then(expect_ok)
    }

    async fn sign_in(&self, request: ApiRequest) -> ClientResult<User> {
        let session: AuthSession = self
            .client
            .http()
            .execute(&request, None)
            .await?
            .into_result()?;
        self.client.credentials().set(session.tokens);
        Ok(session.user)
    }

    async fn call(&self, request: ApiRequest) -> ClientResult<ApiResponse> {
        self.client.send(&request).await
    }
}

fn ordered(ids: &[EntityId]) -> Reordered {
    Reordered {
        ordered_ids: ids.to_vec(),
    }
}

fn expect_ok(response: ApiResponse) -> ClientResult<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(response.into_error())
    }
}

#[async_trait]
impl<C: HttpClient> TaskApi for RestApi<C> {
    async fn tasks(&self) -> ClientResult<Vec<Task>> {
        self.call(ApiRequest::new(Method::Get, "/api/tasks"))
            .await?
            .into_result()
    }

    async fn create_task(&self, new: &NewTask) -> ClientResult<Task> {
        let request = ApiRequest::new(Method::Post, "/api/tasks").with_json(new)?;
        self.call(request).await?.into_result()
    }

    async fn update_task(&self, id: EntityId, patch: &TaskPatch) -> ClientResult<Task> {
        let request = ApiRequest::new(Method::Put, format!("/api/tasks/{id}")).with_json(patch)?;
        self.call(request).await?.into_result()
    }

    async fn delete_task(&self, id: EntityId) -> ClientResult<()> {
        expect_ok(
            self.call(ApiRequest::new(Method::Delete, format!("/api/tasks/{id}")))
                .await?,
        )
    }

    async fn reorder_tasks(&self, ids: &[EntityId]) -> ClientResult<()> {
        let request = ApiRequest::new(Method::Post, "/api/tasks/reorder").with_json(&ordered(ids))?;
        expect_ok(self.call(request).await?)
    }

    async fn create_subtask(&self, task_id: EntityId, new: &NewSubtask) -> ClientResult<Subtask> {
        let request =
            ApiRequest::new(Method::Post, format!("/api/tasks/{task_id}/subtasks")).with_json(new)?;
        self.call(request).await?.into_result()
    }

    async fn update_subtask(&self, id: EntityId, patch: &SubtaskPatch) -> ClientResult<Subtask> {
        let request =
            ApiRequest::new(Method::Put, format!("/api/subtasks/{id}")).with_json(patch)?;
        self.call(request).await?.into_result()
    }

    async fn delete_subtask(&self, id: EntityId) -> ClientResult<()> {
        expect_ok(
            self.call(ApiRequest::new(Method::Delete, format!("/api/subtasks/{id}")))
                .await?,
        )
    }

    async fn reorder_subtasks(&self, task_id: EntityId, ids: &[EntityId]) -> ClientResult<()> {
        let request = ApiRequest::new(
            Method::Post,
            format!("/api/tasks/{task_id}/subtasks/reorder"),
        )
        .with_json(&ordered(ids))?;
        expect_ok(self.call(request).await?)
    }

    async fn lists(&self) -> ClientResult<Vec<List>> {
        self.call(ApiRequest::new(Method::Get, "/api/lists"))
            .await?
            .into_result()
    }

    async fn create_list(&self, new: &NewList) -> ClientResult<List> {
        let request = ApiRequest::new(Method::Post, "/api/lists").with_json(new)?;
        self.call(request).await?.into_result()
    }

    async fn update_list(&self, id: EntityId, patch: &ListPatch) -> ClientResult<List> {
        let request = ApiRequest::new(Method::Put, format!("/api/lists/{id}")).with_json(patch)?;
        self.call(request).await?.into_result()
    }

    async fn delete_list(&self, id: EntityId) -> ClientResult<()> {
        expect_ok(
            self.call(ApiRequest::new(Method::Delete, format!("/api/lists/{id}")))
                .await?,
        )
    }

    async fn reorder_lists(&self, ids: &[EntityId]) -> ClientResult<()> {
        let request = ApiRequest::new(Method::Post, "/api/lists/reorder").with_json(&ordered(ids))?;
        expect_ok(self.call(request).await?)
    }
}
