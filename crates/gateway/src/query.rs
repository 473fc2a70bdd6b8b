//! Row-store query description: equality predicates and ordering against a
//! named collection, rendered as row-store query parameters.

use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    table: &'static str,
    filters: Vec<(String, String)>,
    order: Vec<String>,
}

impl RowQuery {
    pub fn table(table: &'static str) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn eq(mut self, column: &str, value: impl Display) -> Self {
        self.filters
            .push((column.to_string(), format!("eq.{value}")));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        if ascending {
            self.order.push(column.to_string());
        } else {
            self.order.push(format!("{column}.desc"));
        }
        self
    }

    pub fn table_name(&self) -> &'static str {
        self.table
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    pub fn select_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(self.filter_params());
        if !self.order.is_empty() {
            params.push(("order".to_string(), self.order.join(",")));
        }
        params
    }

    /// Parameters for update/delete, which take predicates but no projection.
    pub fn filter_params(&self) -> Vec<(String, String)> {
        self.filters.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_equality_filters_and_combined_ordering() {
        let query = RowQuery::table("questions")
            .eq("year", 2)
            .eq("section", "Rigging")
            .order_by("year", true)
            .order_by("section", true);

        assert_eq!(query.table_name(), "questions");
        assert_eq!(
            query.select_params(),
            vec![
                ("select".to_string(), "*".to_string()),
                ("year".to_string(), "eq.2".to_string()),
                ("section".to_string(), "eq.Rigging".to_string()),
                ("order".to_string(), "year,section".to_string()),
            ]
        );
    }

    #[test]
    fn descending_order_and_mutation_params_skip_projection() {
        let query = RowQuery::table("quiz_attempts")
            .eq("user_id", "abc")
            .order_by("completed_at", false);

        assert_eq!(
            query.select_params().last(),
            Some(&("order".to_string(), "completed_at.desc".to_string()))
        );
        assert_eq!(
            query.filter_params(),
            vec![("user_id".to_string(), "eq.abc".to_string())]
        );
    }

    #[test]
    fn unfiltered_query_reports_no_filters() {
        assert!(!RowQuery::table("study_guides").has_filters());
    }
}
