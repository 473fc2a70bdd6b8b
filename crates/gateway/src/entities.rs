//! Row-store operations: the catalog collections and the caller-owned
//! progress, attempt and activity rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{
        ActivityAction, ProgressId, Question, QuestionId, QuizAttempt, StudyGuide, UserId,
        UserProgress, Year,
    },
    protocol::{ActivityLogInsert, NewProgress, NewQuizAttempt, Owned, ProgressPatch, Session},
};
use tracing::{debug, error};

use crate::{
    catalog::{self, QuestionFilter},
    GatewayError, RowQuery, SupabaseGateway,
};

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    #[serde(flatten)]
    payload: &'a T,
    updated_at: DateTime<Utc>,
}

impl SupabaseGateway {
    /// Session if one is active; catalog reads fall back to the anon key.
    async fn optional_session(&self) -> Result<Option<Session>, GatewayError> {
        match self.active_session().await {
            Ok(session) => Ok(Some(session)),
            Err(GatewayError::NotAuthenticated) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn questions(&self) -> Result<Arc<Vec<Question>>, GatewayError> {
        self.questions
            .get_or_load(|| async move {
                let session = self.optional_session().await?;
                let query = RowQuery::table("questions")
                    .order_by("year", true)
                    .order_by("section", true);
                self.select_rows(&query, session.as_ref()).await
            })
            .await
    }

    pub async fn study_guides(&self) -> Result<Arc<Vec<StudyGuide>>, GatewayError> {
        self.study_guides
            .get_or_load(|| async move {
                let session = self.optional_session().await?;
                let query = RowQuery::table("study_guides")
                    .order_by("year", true)
                    .order_by("section", true);
                self.select_rows(&query, session.as_ref()).await
            })
            .await
    }

    pub async fn filter_questions(
        &self,
        filter: &QuestionFilter,
    ) -> Result<Vec<Question>, GatewayError> {
        let questions = self.questions().await?;
        let selected = catalog::filter_questions(&questions, filter);
        debug!(
            year = ?filter.year,
            section = ?filter.section,
            returned = selected.len(),
            "filtered questions"
        );
        Ok(selected)
    }

    pub async fn study_guides_by_year(&self, year: Year) -> Result<Vec<StudyGuide>, GatewayError> {
        let guides = self.study_guides().await?;
        Ok(catalog::guides_for_year(&guides, year))
    }

    pub async fn study_guide(
        &self,
        year: Year,
        section: &str,
    ) -> Result<Option<StudyGuide>, GatewayError> {
        let guides = self.study_guides().await?;
        Ok(catalog::guide_for(&guides, year, section))
    }

    /// Progress rows created by `created_by` (an email). Asking about anyone
    /// but the signed-in user yields nothing.
    pub async fn filter_progress(&self, created_by: &str) -> Result<Vec<UserProgress>, GatewayError> {
        let Some(session) = self.optional_session().await? else {
            return Ok(Vec::new());
        };
        if session.user.email.as_deref() != Some(created_by) {
            debug!("progress requested for another identity");
            return Ok(Vec::new());
        }

        let query = RowQuery::table("user_progress").eq("user_id", session.user.id);
        self.select_rows(&query, Some(&session)).await
    }

    pub async fn create_progress(&self, payload: &NewProgress) -> Result<UserProgress, GatewayError> {
        let session = self.active_session().await?;
        self.insert_row(
            "user_progress",
            &Owned {
                user_id: session.user.id,
                payload,
            },
            &session,
        )
        .await
        .map_err(|err| {
            error!(%err, "failed to create user progress");
            err
        })
    }

    pub async fn update_progress(
        &self,
        id: ProgressId,
        patch: &ProgressPatch,
    ) -> Result<UserProgress, GatewayError> {
        let session = self.active_session().await?;
        let query = RowQuery::table("user_progress")
            .eq("id", id)
            .eq("user_id", session.user.id);
        self.update_row(
            &query,
            &Stamped {
                payload: patch,
                updated_at: Utc::now(),
            },
            &session,
        )
        .await
        .map_err(|err| {
            error!(progress_id = %id, %err, "failed to update user progress");
            err
        })
    }

    /// Removes every progress row owned by the signed-in user.
    pub async fn delete_progress(&self) -> Result<(), GatewayError> {
        let session = self.active_session().await?;
        let query = RowQuery::table("user_progress").eq("user_id", session.user.id);
        self.delete_rows(&query, &session).await
    }

    pub async fn toggle_bookmark(
        &self,
        progress: &UserProgress,
        question_id: QuestionId,
        bookmarked: bool,
    ) -> Result<UserProgress, GatewayError> {
        let patch = ProgressPatch {
            bookmarked_questions: Some(progress.bookmarks_with(question_id, bookmarked)),
            ..ProgressPatch::default()
        };
        self.update_progress(progress.id, &patch).await
    }

    /// Attempts by `user_id`, newest first. Empty for any other identity.
    pub async fn filter_attempts(&self, user_id: UserId) -> Result<Vec<QuizAttempt>, GatewayError> {
        let Some(session) = self.optional_session().await? else {
            return Ok(Vec::new());
        };
        if session.user.id != user_id {
            debug!("quiz attempts requested for another identity");
            return Ok(Vec::new());
        }

        let query = RowQuery::table("quiz_attempts")
            .eq("user_id", user_id)
            .order_by("completed_at", false);
        self.select_rows(&query, Some(&session)).await
    }

    pub async fn create_attempt(&self, attempt: &NewQuizAttempt) -> Result<QuizAttempt, GatewayError> {
        let session = self.active_session().await?;
        self.insert_row(
            "quiz_attempts",
            &Owned {
                user_id: session.user.id,
                payload: attempt,
            },
            &session,
        )
        .await
        .map_err(|err| {
            error!(%err, "failed to record quiz attempt");
            err
        })
    }

    pub(crate) async fn record_activity(&self, session: &Session) -> Result<(), GatewayError> {
        self.insert_minimal(
            "user_activity_logs",
            &ActivityLogInsert {
                user_id: session.user.id,
                action: ActivityAction::AppLogin,
                created_at: Utc::now(),
            },
            session,
        )
        .await
    }
}
