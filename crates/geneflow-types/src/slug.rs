//! Filesystem-safe names for jobs, steps, and log files.

/// Convert a name into a lowercase, hyphen-separated slug.
///
/// - Lowercase all characters
/// - Replace runs of non-alphanumeric characters with a single hyphen
/// - Trim leading/trailing hyphens
///
/// # Examples
///
/// ```
/// use geneflow_types::slug::slugify;
///
/// assert_eq!(slugify("BWA Align"), "bwa-align");
/// assert_eq!(slugify("sample_a.sam"), "sample-a-sam");
/// assert_eq!(slugify("--index--"), "index");
/// ```
pub fn slugify(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut prev_was_hyphen = true;
    for c in name.to_lowercase().chars() {
        if c.is_alphanumeric() {
            result.push(c);
            prev_was_hyphen = false;
        } else if !prev_was_hyphen {
            result.push('-');
            prev_was_hyphen = true;
        }
    }

    if result.ends_with('-') {
        result.pop();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Align Reads"), "align-reads");
    }

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("a__b..c"), "a-b-c");
    }

    #[test]
    fn test_slugify_empty() {
        assert_eq!(slugify("___"), "");
    }
}
