/// Convert an entity class name to the snake_case variable name templates see.
///
/// `SubjectAssertion` becomes `subject_assertion`; acronym runs stay together
/// (`HTTPRequest` becomes `http_request`).
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(char::is_lowercase),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_class_names() {
        assert_eq!(to_snake_case("Patient"), "patient");
        assert_eq!(to_snake_case("SubjectAssertion"), "subject_assertion");
        assert_eq!(to_snake_case("ResearchStudy"), "research_study");
    }

    #[test]
    fn test_acronym_runs() {
        assert_eq!(to_snake_case("HTTPRequest"), "http_request");
        assert_eq!(to_snake_case("DNASample"), "dna_sample");
    }

    #[test]
    fn test_already_snake_case() {
        assert_eq!(to_snake_case("study_subject"), "study_subject");
        assert_eq!(to_snake_case("access-control"), "access_control");
    }
}
