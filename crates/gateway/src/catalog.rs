//! Process-lifetime caches for the read-mostly catalog collections, plus the
//! pure lookups pages run against them.

use std::{future::Future, sync::Arc};

use shared::domain::{Question, StudyGuide, Year};
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::GatewayError;

/// Single-assignment cache. Concurrent first readers share one in-flight
/// load; a failed load leaves the cell empty so the next reader retries.
/// Never invalidated within a process.
pub struct Catalog<T> {
    name: &'static str,
    cell: OnceCell<Arc<Vec<T>>>,
}

impl<T> Catalog<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceCell::new(),
        }
    }

    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<Vec<T>>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, GatewayError>>,
    {
        self.cell
            .get_or_try_init(|| async move {
                let rows = load().await?;
                info!(catalog = self.name, rows = rows.len(), "catalog cached");
                Ok::<_, GatewayError>(Arc::new(rows))
            })
            .await
            .cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestionFilter {
    pub year: Option<Year>,
    pub section: Option<String>,
}

impl QuestionFilter {
    pub fn year(year: Year) -> Self {
        Self {
            year: Some(year),
            section: None,
        }
    }

    pub fn matches(&self, question: &Question) -> bool {
        self.year.map_or(true, |year| question.year == year)
            && self
                .section
                .as_deref()
                .map_or(true, |section| question.section == section)
    }
}

pub fn filter_questions(questions: &[Question], filter: &QuestionFilter) -> Vec<Question> {
    questions
        .iter()
        .filter(|question| filter.matches(question))
        .cloned()
        .collect()
}

/// Guides for one year, ordered by section.
pub fn guides_for_year(guides: &[StudyGuide], year: Year) -> Vec<StudyGuide> {
    let mut selected: Vec<StudyGuide> = guides
        .iter()
        .filter(|guide| guide.year == year)
        .cloned()
        .collect();
    selected.sort_by(|a, b| a.section.cmp(&b.section));
    selected
}

pub fn guide_for(guides: &[StudyGuide], year: Year, section: &str) -> Option<StudyGuide> {
    guides
        .iter()
        .find(|guide| guide.year == year && guide.section == section)
        .cloned()
}

/// Distinct sections in first-seen order.
pub fn sections_of(guides: &[StudyGuide]) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    for guide in guides {
        if !sections.contains(&guide.section) {
            sections.push(guide.section.clone());
        }
    }
    sections
}

pub fn search_guides<'a>(
    guides: &'a [StudyGuide],
    section: Option<&str>,
    term: &str,
) -> Vec<&'a StudyGuide> {
    let term = term.to_lowercase();
    guides
        .iter()
        .filter(|guide| section.map_or(true, |section| guide.section == section))
        .filter(|guide| {
            guide.title.to_lowercase().contains(&term)
                || guide.content.to_lowercase().contains(&term)
        })
        .collect()
}

pub fn search_questions<'a>(questions: &'a [Question], term: &str) -> Vec<&'a Question> {
    let term = term.to_lowercase();
    questions
        .iter()
        .filter(|question| {
            question.question.to_lowercase().contains(&term)
                || question.section.to_lowercase().contains(&term)
        })
        .collect()
}
