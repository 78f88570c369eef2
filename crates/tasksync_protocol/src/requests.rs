//! Request and response bodies of the REST API.

use crate::entity::{EntityId, List, Subtask, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    /// Task text.
    pub text: String,
    /// Tags to attach.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Important flag.
    #[serde(default)]
    pub important: bool,
    /// Completed flag.
    #[serde(default)]
    pub completed: bool,
    /// Target list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<EntityId>,
}

impl NewTask {
    /// Creates a draft with the given text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Builds a draft from free-form input.
    ///
    /// Words starting with `#` become tags and are removed from the text. When
    /// the user is looking at a tag filter, that tag is attached as well so the
    /// new task stays visible under the filter.
    ///
    /// ```
    /// use tasksync_protocol::NewTask;
    ///
    /// let draft = NewTask::parse("Buy milk #errand", Some("errand"));
    /// assert_eq!(draft.text, "Buy milk");
    /// assert_eq!(draft.tags, vec!["errand".to_string()]);
    /// ```
    pub fn parse(input: &str, active_tag: Option<&str>) -> Self {
        let mut words = Vec::new();
        let mut tags: Vec<String> = Vec::new();

        for word in input.split_whitespace() {
            match word.strip_prefix('#') {
                Some(tag) if !tag.is_empty() => {
                    if !tags.iter().any(|t| t == tag) {
                        tags.push(tag.to_string());
                    }
                }
                _ => words.push(word),
            }
        }

        if let Some(tag) = active_tag.filter(|t| !t.is_empty()) {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }

        Self {
            text: words.join(" "),
            tags,
            ..Self::default()
        }
    }

    /// Sets the target list.
    pub fn in_list(mut self, list_id: EntityId) -> Self {
        self.list_id = Some(list_id);
        self
    }

    /// Builds the provisional entity shown while the create is in flight.
    pub fn provisional(&self, id: EntityId) -> Task {
        let now = Utc::now();
        Task {
            id,
            user_id: 0,
            list_id: self.list_id,
            text: self.text.clone(),
            completed: self.completed,
            important: self.important,
            is_expanded: false,
            sort_order: 0,
            tags: self.tags.clone(),
            subtasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of `PUT /api/tasks/{id}`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    /// New text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// New completed flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// New important flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important: Option<bool>,
    /// New expanded flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_expanded: Option<bool>,
    /// New list; `Some(None)` moves the task out of any list.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub list_id: Option<Option<EntityId>>,
    /// Replacement tag set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl TaskPatch {
    /// Applies the patch to a task in place.
    pub fn apply(&self, task: &mut Task) {
        if let Some(text) = &self.text {
            task.text = text.clone();
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
        if let Some(important) = self.important {
            task.important = important;
        }
        if let Some(is_expanded) = self.is_expanded {
            task.is_expanded = is_expanded;
        }
        if let Some(list_id) = self.list_id {
            task.list_id = list_id;
        }
        if let Some(tags) = &self.tags {
            task.tags = tags.clone();
        }
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Body of `POST /api/tasks/{id}/subtasks`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubtask {
    /// Subtask text.
    pub text: String,
}

impl NewSubtask {
    /// Builds the provisional entity shown while the create is in flight.
    pub fn provisional(&self, id: EntityId, task_id: EntityId) -> Subtask {
        Subtask {
            id,
            task_id,
            text: self.text.clone(),
            completed: false,
            sort_order: 0,
            created_at: Utc::now(),
        }
    }
}

/// Body of `PUT /api/subtasks/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskPatch {
    /// New text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// New completed flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl SubtaskPatch {
    /// Applies the patch to a subtask in place.
    pub fn apply(&self, subtask: &mut Subtask) {
        if let Some(text) = &self.text {
            subtask.text = text.clone();
        }
        if let Some(completed) = self.completed {
            subtask.completed = completed;
        }
    }
}

/// Body of `POST /api/lists`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewList {
    /// Display title.
    pub title: String,
}

impl NewList {
    /// Builds the provisional entity shown while the create is in flight.
    pub fn provisional(&self, id: EntityId) -> List {
        let now = Utc::now();
        List {
            id,
            user_id: 0,
            title: self.title.clone(),
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of `PUT /api/lists/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPatch {
    /// New title.
    pub title: String,
}

impl ListPatch {
    /// Applies the patch to a list in place.
    pub fn apply(&self, list: &mut List) {
        list.title = self.title.clone();
    }
}

/// A short-lived/long-lived credential pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    /// Bearer token for REST calls and the socket upgrade.
    pub access_token: String,
    /// Single-use token exchanged for a fresh pair.
    pub refresh_token: String,
    /// Expiry of the access token.
    pub expires_at: DateTime<Utc>,
}

/// An account as the API shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Server-assigned id; every entity's `userId` refers to it.
    pub id: i64,
    /// Login email, stored lowercased.
    pub email: String,
    /// Optional display name.
    #[serde(default)]
    pub display_name: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/auth/register`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Login email.
    pub email: String,
    /// Plain-text password, at least 8 characters.
    pub password: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Body of `POST /api/auth/login`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    /// Login email.
    pub email: String,
    /// Plain-text password.
    pub password: String,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Response of register and login: the account plus a fresh credential
/// pair, flattened so the body also decodes as [`AuthTokens`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// The signed-in account.
    pub user: User,
    /// Its new credential pair.
    #[serde(flatten)]
    pub tokens: AuthTokens,
}

/// Body of `POST /api/auth/refresh` and `POST /api/auth/logout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// The long-lived credential being presented.
    pub refresh_token: String,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_tags() {
        let draft = NewTask::parse("  call #work mom #family #work ", None);
        assert_eq!(draft.text, "call mom");
        assert_eq!(draft.tags, vec!["work".to_string(), "family".to_string()]);
    }

    #[test]
    fn parse_adds_active_filter_once() {
        let draft = NewTask::parse("Buy milk #errand", Some("errand"));
        assert_eq!(draft.tags, vec!["errand".to_string()]);

        let draft = NewTask::parse("Buy milk", Some("errand"));
        assert_eq!(draft.text, "Buy milk");
        assert_eq!(draft.tags, vec!["errand".to_string()]);
    }

    #[test]
    fn lone_hash_is_text() {
        let draft = NewTask::parse("item # 4", None);
        assert_eq!(draft.text, "item # 4");
        assert!(draft.tags.is_empty());
    }

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let clear: TaskPatch = serde_json::from_str(r#"{"listId": null}"#).unwrap();
        assert_eq!(clear.list_id, Some(None));

        let absent: TaskPatch = serde_json::from_str(r#"{"completed": true}"#).unwrap();
        assert_eq!(absent.list_id, None);
        assert_eq!(absent.completed, Some(true));
    }

    #[test]
    fn patch_apply() {
        let mut task = NewTask::new("old").in_list(3).provisional(1);
        TaskPatch {
            text: Some("new".into()),
            list_id: Some(None),
            ..TaskPatch::default()
        }
        .apply(&mut task);

        assert_eq!(task.text, "new");
        assert_eq!(task.list_id, None);
        assert!(TaskPatch::default().is_empty());
    }

    #[test]
    fn auth_session_is_flat() {
        let json = r#"{"user":{"id":3,"email":"a@b.c","createdAt":"2030-01-01T00:00:00Z"},
            "accessToken":"a","refreshToken":"r","expiresAt":"2030-01-01T00:00:00Z"}"#;
        let session: AuthSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.user.id, 3);
        assert_eq!(session.user.display_name, "");

        let tokens: AuthTokens = serde_json::from_str(json).unwrap();
        assert_eq!(tokens, session.tokens);
    }

    #[test]
    fn passwords_stay_out_of_debug_output() {
        let login = Login {
            email: "a@b.c".into(),
            password: "hunter22".into(),
        };
        assert!(!format!("{login:?}").contains("hunter22"));
    }

    #[test]
    fn auth_tokens_shape() {
        let json = r#"{"accessToken":"a","refreshToken":"r","expiresAt":"2030-01-01T00:00:00Z"}"#;
        let tokens: AuthTokens = serde_json::from_str(json).unwrap();
        assert_eq!(tokens.access_token, "a");
        assert_eq!(tokens.refresh_token, "r");
    }
}
