//! Username validation shared by the CONNECT and scored-attempt paths.

/// Why a username was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameError {
    Empty,
    TooLong { len: usize, max: usize },
    InvalidChar(char),
}

impl std::fmt::Display for UsernameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsernameError::Empty => write!(f, "username is empty"),
            UsernameError::TooLong { len, max } => {
                write!(f, "username is {} characters, maximum is {}", len, max)
            }
            UsernameError::InvalidChar(c) => write!(f, "username contains {:?}", c),
        }
    }
}

impl std::error::Error for UsernameError {}

/// Accept only ASCII letters, digits, `_` and `-`, between 1 and `max_len`
/// characters.
pub fn validate_username(username: &str, max_len: usize) -> Result<(), UsernameError> {
    if username.is_empty() {
        return Err(UsernameError::Empty);
    }

    let len = username.chars().count();
    if len > max_len {
        return Err(UsernameError::TooLong { len, max: max_len });
    }

    match username
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        Some(c) => Err(UsernameError::InvalidChar(c)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        assert!(validate_username("alice", 20).is_ok());
        assert!(validate_username("Bob_99", 20).is_ok());
        assert!(validate_username("x-y-z", 20).is_ok());
        assert!(validate_username("a", 1).is_ok());
    }

    #[test]
    fn test_empty() {
        assert_eq!(validate_username("", 20), Err(UsernameError::Empty));
    }

    #[test]
    fn test_too_long() {
        let name = "a".repeat(21);
        assert_eq!(
            validate_username(&name, 20),
            Err(UsernameError::TooLong { len: 21, max: 20 })
        );
        assert!(validate_username(&"a".repeat(20), 20).is_ok());
    }

    #[test]
    fn test_rejects_space_and_symbols() {
        assert_eq!(
            validate_username("bad name", 20),
            Err(UsernameError::InvalidChar(' '))
        );
        assert_eq!(
            validate_username("pipe|name", 20),
            Err(UsernameError::InvalidChar('|'))
        );
        assert_eq!(
            validate_username("café", 20),
            Err(UsernameError::InvalidChar('é'))
        );
    }
}
