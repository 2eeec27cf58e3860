/// Replace `${ENV_VAR}` placeholders in a raw config file.
///
/// Unresolvable variables are left as-is so the parse error (or the literal
/// value) points at the missing variable.
pub fn substitute_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next(); // consume '{'

        let mut var_name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            var_name.push(c);
        }

        match std::env::var(&var_name) {
            Ok(val) if closed && !var_name.is_empty() => result.push_str(&val),
            _ => {
                result.push_str("${");
                result.push_str(&var_name);
                if closed {
                    result.push('}');
                }
            },
        }
    }

    result
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        unsafe { std::env::set_var("CHATRELAY_SUBST_VAR", "qwen-plus") };
        assert_eq!(
            substitute_env("model = \"${CHATRELAY_SUBST_VAR}\""),
            "model = \"qwen-plus\""
        );
        unsafe { std::env::remove_var("CHATRELAY_SUBST_VAR") };
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_env("${CHATRELAY_NONEXISTENT_XYZ}"),
            "${CHATRELAY_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env("key = ${OPEN"), "key = ${OPEN");
    }

    #[test]
    fn lone_dollar_is_kept() {
        assert_eq!(substitute_env("price = $5"), "price = $5");
    }
}
