/// Expand `${NAME}` and `${NAME:-fallback}` placeholders from the process environment.
///
/// Unresolvable placeholders without a fallback are left untouched.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with an injectable lookup.
pub(crate) fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder, keep the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "MCPDOCK_TEST_HOME" => Some("/srv/mcpdock".to_string()),
            _ => None,
        }
    }

    #[test]
    fn expands_known_variable() {
        assert_eq!(
            substitute_env_with("data_dir = \"${MCPDOCK_TEST_HOME}/data\"", lookup),
            "data_dir = \"/srv/mcpdock/data\""
        );
    }

    #[test]
    fn keeps_unknown_variable() {
        assert_eq!(
            substitute_env_with("${MCPDOCK_MISSING}", lookup),
            "${MCPDOCK_MISSING}"
        );
    }

    #[test]
    fn uses_fallback_for_unknown_variable() {
        assert_eq!(
            substitute_env_with("timeout=${MCPDOCK_MISSING:-15}", lookup),
            "timeout=15"
        );
    }

    #[test]
    fn keeps_unterminated_placeholder() {
        assert_eq!(substitute_env_with("a ${oops", lookup), "a ${oops");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(substitute_env("no placeholders here"), "no placeholders here");
    }
}
