//! Classification of Drive activity and composition of notifications.
//!
//! An [`ActivityEvent`] is reduced to a [`HandlerCase`] by a pure
//! classification over `(kind, sub_type)`; [`ActivityRouter`] then composes
//! the matching [`NotificationMessage`] and hands it to the dispatcher.
//!
//! Composition is best-effort. File and comment lookups are optional
//! enrichments: a failed lookup leaves the corresponding fields empty and
//! the notification is still sent.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::credentials::AccessToken;
use crate::drive::{Comment, DriveActivity, DriveApi, FileComment, FileMetadata};
use crate::notify::NotificationDispatcher;
use crate::types::{ActionIntegration, Attachment, AttachmentAction, NotificationMessage};

/// Action kind of comment posts.
pub const KIND_COMMENT: &str = "comment";

/// Action kind of suggestion comments.
pub const KIND_SUGGESTION: &str = "suggestion";

/// Action kind of comment assignments.
pub const KIND_ASSIGNMENT: &str = "assignment";

/// Action kind of a newly shared file.
pub const KIND_SHARE: &str = "share";

/// Footer shown on shared-file previews.
const SHARE_FOOTER: &str = "Google Drive";

/// Notification to compose for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerCase {
    CommentAdded,
    CommentDeleted,
    ReplyAdded,
    ReplyDeleted,
    Resolved,
    Reopened,
    SuggestionReplyAdded,
    FileShared,
    /// Not handled; dropped silently.
    Unrecognized,
}

impl HandlerCase {
    /// Maps an action kind and sub-type to a case.
    pub fn classify(kind: &str, sub_type: &str) -> Self {
        match (kind, sub_type) {
            (KIND_COMMENT, "ADDED") => Self::CommentAdded,
            (KIND_COMMENT, "DELETED") => Self::CommentDeleted,
            (KIND_COMMENT, "REPLY_ADDED") => Self::ReplyAdded,
            (KIND_COMMENT, "REPLY_DELETED") => Self::ReplyDeleted,
            (KIND_COMMENT, "RESOLVED") => Self::Resolved,
            (KIND_COMMENT, "REOPENED") => Self::Reopened,
            (KIND_SUGGESTION, "REPLY_ADDED") => Self::SuggestionReplyAdded,
            (KIND_SHARE, _) => Self::FileShared,
            _ => Self::Unrecognized,
        }
    }
}

/// A single change to notify a user about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityEvent {
    pub file_id: String,

    /// Acting user as reported by the activity (a `people/..` resource name).
    pub actor: Option<String>,

    pub kind: String,

    pub sub_type: String,

    /// Comment target, for comment and suggestion events.
    pub comment: Option<FileComment>,
}

impl ActivityEvent {
    /// Builds an event from a Drive Activity record.
    ///
    /// Returns `None` for activities that are not comment actions.
    pub fn from_activity(file_id: &str, activity: &DriveActivity) -> Option<Self> {
        let action = activity.primary_action_detail.comment.as_ref()?;

        let (kind, detail) = if let Some(post) = &action.post {
            (KIND_COMMENT, post)
        } else if let Some(suggestion) = &action.suggestion {
            (KIND_SUGGESTION, suggestion)
        } else if let Some(assignment) = &action.assignment {
            (KIND_ASSIGNMENT, assignment)
        } else {
            return None;
        };

        let actor = activity
            .actors
            .first()
            .and_then(|a| a.user.as_ref())
            .and_then(|u| u.known_user.as_ref())
            .map(|k| k.person_name.clone());

        Some(Self {
            file_id: file_id.to_string(),
            actor,
            kind: kind.to_string(),
            sub_type: detail.subtype.clone(),
            comment: activity.file_comment().cloned(),
        })
    }

    /// Event for a file newly shared with the user.
    pub fn file_shared(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            kind: KIND_SHARE.to_string(),
            ..Self::default()
        }
    }

    /// Classifies the event by its action kind and sub-type.
    pub fn case(&self) -> HandlerCase {
        HandlerCase::classify(&self.kind, &self.sub_type)
    }

    fn comment_target(&self) -> FileComment {
        self.comment.clone().unwrap_or_default()
    }
}

/// `![alt](url)`
fn inline_image(alt: &str, url: &str) -> String {
    format!("![{alt}]({url})")
}

/// `[text](url)`
fn hyperlink(text: &str, url: &str) -> String {
    format!("[{text}]({url})")
}

/// Routes activity events to notifications.
pub struct ActivityRouter {
    drive: Arc<dyn DriveApi>,
    dispatcher: NotificationDispatcher,
    public_url: String,
}

impl ActivityRouter {
    /// Creates a router. `public_url` is the base for reply action URLs.
    pub fn new(
        drive: Arc<dyn DriveApi>,
        dispatcher: NotificationDispatcher,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            drive,
            dispatcher,
            public_url: public_url.into(),
        }
    }

    /// Composes and dispatches the notification for `event`.
    ///
    /// Returns `true` if a notification was delivered.
    pub async fn handle(&self, token: &AccessToken, user_id: &str, event: &ActivityEvent) -> bool {
        match self.compose(token, user_id, event).await {
            Some(message) => self.dispatcher.dispatch(&message).await,
            None => false,
        }
    }

    /// Builds the notification for `event`, or `None` if the event is not
    /// one the router handles.
    pub async fn compose(
        &self,
        token: &AccessToken,
        user_id: &str,
        event: &ActivityEvent,
    ) -> Option<NotificationMessage> {
        let case = event.case();
        if case == HandlerCase::Unrecognized {
            debug!(
                user_id = %user_id,
                kind = %event.kind,
                sub_type = %event.sub_type,
                "Ignoring unrecognized activity"
            );
            return None;
        }

        let file = self.fetch_file(token, &event.file_id).await.unwrap_or_default();
        let target = event.comment_target();
        let icon = inline_image("File icon:", &file.icon_link);
        let discussion_link = hyperlink(&file.name, &target.link_to_discussion);

        let message = match case {
            HandlerCase::CommentAdded => {
                let comment = self
                    .fetch_comment(token, &event.file_id, &target.legacy_comment_id, false)
                    .await
                    .unwrap_or_default();
                let quoted = comment
                    .quoted_file_content
                    .as_ref()
                    .map(|q| q.value.as_str())
                    .unwrap_or_default();

                NotificationMessage::text(user_id, "").with_attachment(Attachment {
                    pretext: format!(
                        "{} commented on {icon} {}",
                        comment.author_name(),
                        hyperlink(&file.name, &file.web_view_link)
                    ),
                    text: format!("{quoted}\n> {}", comment.content),
                    actions: vec![self.reply_action(&target.legacy_comment_id, &event.file_id)],
                    ..Attachment::default()
                })
            }
            HandlerCase::ReplyAdded => {
                let comment = self
                    .fetch_comment(token, &event.file_id, &target.legacy_discussion_id, true)
                    .await
                    .unwrap_or_default();
                let mut replies = comment.replies.iter().rev();
                let last = replies.next();
                let before_last = replies.next();
                let author = last
                    .and_then(|r| r.author.as_ref())
                    .map(|a| a.display_name.as_str())
                    .unwrap_or_else(|| comment.author_name());

                NotificationMessage::text(user_id, "").with_attachment(Attachment {
                    pretext: format!("{author} replied on {icon} {discussion_link}"),
                    text: format!(
                        "Previous reply:\n{}\n> {}",
                        before_last.map(|r| r.content.as_str()).unwrap_or_default(),
                        last.map(|r| r.content.as_str()).unwrap_or_default()
                    ),
                    actions: vec![self.reply_action(&target.legacy_discussion_id, &event.file_id)],
                    ..Attachment::default()
                })
            }
            HandlerCase::CommentDeleted => NotificationMessage::text(
                user_id,
                format!("A comment was deleted in {icon} {discussion_link}"),
            ),
            HandlerCase::ReplyDeleted => NotificationMessage::text(
                user_id,
                format!("A comment reply was deleted in {icon} {discussion_link}"),
            ),
            HandlerCase::Resolved => {
                let comment = self
                    .fetch_comment(token, &event.file_id, &target.legacy_comment_id, true)
                    .await
                    .unwrap_or_default();
                NotificationMessage::text(
                    user_id,
                    format!(
                        "{} marked a thread as resolved in {icon} {discussion_link}",
                        comment.author_name()
                    ),
                )
            }
            HandlerCase::Reopened => {
                let comment = self
                    .fetch_comment(token, &event.file_id, &target.legacy_discussion_id, true)
                    .await
                    .unwrap_or_default();
                NotificationMessage::text(
                    user_id,
                    format!(
                        "{} reopened a thread in {icon} {discussion_link}",
                        comment.author_name()
                    ),
                )
            }
            HandlerCase::SuggestionReplyAdded => {
                let modifier = file
                    .last_modifying_user
                    .as_ref()
                    .map(|u| u.display_name.as_str())
                    .unwrap_or_default();
                NotificationMessage::text(
                    user_id,
                    format!("{modifier} added a new suggestion in {icon} {discussion_link}"),
                )
            }
            HandlerCase::FileShared => {
                let sharer = file
                    .sharing_user
                    .as_ref()
                    .map(|u| {
                        if u.display_name.is_empty() {
                            u.email_address.clone().unwrap_or_default()
                        } else {
                            u.display_name.clone()
                        }
                    })
                    .unwrap_or_default();
                NotificationMessage::text(user_id, format!("{sharer} shared an item with you"))
                    .with_attachment(Attachment {
                        title: file.name.clone(),
                        title_link: file.web_view_link.clone(),
                        footer: SHARE_FOOTER.to_string(),
                        footer_icon: file.icon_link.clone(),
                        ..Attachment::default()
                    })
            }
            HandlerCase::Unrecognized => return None,
        };

        debug!(user_id = %user_id, file_id = %event.file_id, case = ?case, "Composed notification");
        Some(message)
    }

    fn reply_action(&self, comment_id: &str, file_id: &str) -> AttachmentAction {
        AttachmentAction {
            name: "Reply to comment".to_string(),
            integration: ActionIntegration {
                url: format!("{}/api/v1/reply_dialog", self.public_url),
                context: BTreeMap::from([
                    ("commentId".to_string(), comment_id.to_string()),
                    ("fileId".to_string(), file_id.to_string()),
                ]),
            },
        }
    }

    async fn fetch_file(&self, token: &AccessToken, file_id: &str) -> Option<FileMetadata> {
        match self.drive.get_file(token, file_id).await {
            Ok(file) => Some(file),
            Err(e) => {
                debug!(file_id = %file_id, error = %e, "File lookup failed, composing without it");
                None
            }
        }
    }

    async fn fetch_comment(
        &self,
        token: &AccessToken,
        file_id: &str,
        comment_id: &str,
        include_deleted: bool,
    ) -> Option<Comment> {
        if comment_id.is_empty() {
            return None;
        }
        match self
            .drive
            .get_comment(token, file_id, comment_id, include_deleted)
            .await
        {
            Ok(comment) => Some(comment),
            Err(e) => {
                debug!(
                    file_id = %file_id,
                    comment_id = %comment_id,
                    error = %e,
                    "Comment lookup failed, composing without it"
                );
                None
            }
        }
    }
}
