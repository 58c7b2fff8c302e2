//! Destination filename construction.

use chrono::{Local, NaiveDate};

use super::parser::DocumentFields;

/// Formats tried after strict MM/DD/YYYY, loosest last.
const FALLBACK_DATE_FORMATS: &[&str] = &[
    "%m-%d-%Y",
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
];

/// Deterministic destination filename: `YYYY-MM-DD_Company_Id<ext>`.
///
/// `extension` is the original extension including its dot (possibly
/// empty). Identical fields always map to the same name, so two different
/// source files with the same extracted fields collide; the dispatcher
/// resolves that with a numeric suffix at relocation time.
pub fn destination_name(fields: &DocumentFields, extension: &str) -> String {
    let date = document_date(&fields.document_date).format("%Y-%m-%d");
    format!(
        "{date}_{}_{}{extension}",
        sanitize_company(&fields.company_name),
        sanitize_id(&fields.document_id)
    )
}

/// Parse the extracted date string, falling back to today. Never fails.
fn document_date(raw: &str) -> NaiveDate {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%m/%d/%Y") {
        return date;
    }
    for format in FALLBACK_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date;
        }
    }
    Local::now().date_naive()
}

/// Strip a company name down to `[A-Za-z0-9 ]`, then collapse whitespace
/// runs into single underscores.
fn sanitize_company(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Document ids pass through mostly as-is (`INV-42` keeps its hyphen), but
/// anything that would break the destination path is dropped.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(company: &str, id: &str, date: &str) -> DocumentFields {
        DocumentFields {
            company_name: company.to_string(),
            document_id: id.to_string(),
            document_date: date.to_string(),
        }
    }

    #[test]
    fn builds_expected_name_from_punctuated_company() {
        let name = destination_name(&fields("Acme, Inc.", "INV-42", "04/09/2025"), ".jpg");
        assert_eq!(name, "2025-04-09_Acme_Inc_INV-42.jpg");
    }

    #[test]
    fn unparseable_date_falls_back_to_today() {
        let name = destination_name(&fields("X", "1", "not-a-date"), ".png");
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert!(name.starts_with(&today), "got {name}");
    }

    #[test]
    fn iso_date_is_accepted_by_the_fallback_tier() {
        let name = destination_name(&fields("X", "1", "2025-04-09"), ".pdf");
        assert_eq!(name, "2025-04-09_X_1.pdf");
    }

    #[test]
    fn is_deterministic() {
        let input = fields("Globex Corp", "A-7", "12/31/2024");
        assert_eq!(
            destination_name(&input, ".jpg"),
            destination_name(&input, ".jpg")
        );
    }

    #[test]
    fn whitespace_runs_collapse_to_single_underscores() {
        let name = destination_name(&fields("  Widgets   &  Co.  ", "9", "01/02/2025"), ".jpg");
        assert_eq!(name, "2025-01-02_Widgets_Co_9.jpg");
    }

    #[test]
    fn path_breaking_characters_are_dropped_from_the_id() {
        let name = destination_name(&fields("X", "A/B:C", "01/02/2025"), ".jpg");
        assert_eq!(name, "2025-01-02_X_ABC.jpg");
    }

    #[test]
    fn empty_extension_is_allowed() {
        let name = destination_name(&fields("X", "1", "01/02/2025"), "");
        assert_eq!(name, "2025-01-02_X_1");
    }
}
