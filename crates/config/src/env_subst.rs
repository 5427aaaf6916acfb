/// Expand `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// A variable that is unset and has no fallback is left verbatim so the
/// parse error (or the literal value) points at the missing name.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: copy the remainder untouched.
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) if !value.is_empty() || fallback.is_none() => {
                out.push_str(&value)
            },
            (false, _, Some(fallback)) => out.push_str(fallback),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
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
            "ROUTER_TOKEN" => Some("abc".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn expands_known_var() {
        assert_eq!(
            substitute_env_with("token = \"${ROUTER_TOKEN}\"", lookup),
            "token = \"abc\""
        );
    }

    #[test]
    fn unknown_var_without_fallback_is_kept() {
        assert_eq!(substitute_env_with("${NOPE}", lookup), "${NOPE}");
    }

    #[test]
    fn fallback_applies_to_unset_and_empty() {
        assert_eq!(substitute_env_with("${NOPE:-8080}", lookup), "8080");
        assert_eq!(substitute_env_with("${EMPTY:-x}", lookup), "x");
        assert_eq!(substitute_env_with("${ROUTER_TOKEN:-x}", lookup), "abc");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env_with("a ${B", lookup), "a ${B");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(substitute_env("port = 1"), "port = 1");
    }
}
