use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId, Uuid);
id_newtype!(QuestionId, i64);
id_newtype!(StudyGuideId, i64);
id_newtype!(ProgressId, i64);
id_newtype!(AttemptId, i64);

/// Apprenticeship year a question or guide belongs to.
pub type Year = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    /// Profiles carry free-form role strings; anything unrecognised is a plain user.
    pub fn from_remote(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(role) if role.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::User,
        }
    }
}

/// Resolved user profile as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub selected_year: Option<Year>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub year: Year,
    pub section: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyGuide {
    pub id: StudyGuideId,
    pub year: Year,
    pub section: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
    pub id: ProgressId,
    pub user_id: UserId,
    #[serde(default)]
    pub total_questions_answered: u32,
    #[serde(default)]
    pub quizzes_completed: u32,
    #[serde(default)]
    pub bookmarked_questions: Vec<QuestionId>,
    #[serde(default)]
    pub weak_questions: Vec<QuestionId>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProgress {
    pub fn is_bookmarked(&self, question_id: QuestionId) -> bool {
        self.bookmarked_questions.contains(&question_id)
    }

    /// Bookmark list after setting `question_id` to `bookmarked`, without duplicates.
    pub fn bookmarks_with(&self, question_id: QuestionId, bookmarked: bool) -> Vec<QuestionId> {
        let mut bookmarks: Vec<QuestionId> = self
            .bookmarked_questions
            .iter()
            .copied()
            .filter(|id| *id != question_id)
            .collect();
        if bookmarked {
            bookmarks.push(question_id);
        }
        bookmarks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizAttempt {
    pub id: AttemptId,
    pub user_id: UserId,
    pub mode: String,
    #[serde(default)]
    pub year: Option<Year>,
    #[serde(default)]
    pub section: Option<String>,
    pub score: u32,
    pub total_questions: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    AppLogin,
}
