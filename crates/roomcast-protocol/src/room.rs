//! Room name rules shared by client joins and inbound envelopes.

/// Maximum room name length in bytes.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("lobby").is_ok());
        assert!(validate_room_name("team:general").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("$system").is_err());
        assert!(validate_room_name("tab\there").is_err());
        assert!(validate_room_name("line\nbreak").is_err());
        assert!(validate_room_name("café").is_ok());
        assert!(validate_room_name("日本語").is_ok());
        assert!(validate_room_name("team chat 🎉").is_ok());

        let long_name = "a".repeat(MAX_ROOM_NAME_LENGTH + 1);
        assert!(validate_room_name(&long_name).is_err());
        assert!(validate_room_name(&long_name[1..]).is_ok());

        // The limit counts bytes, not characters.
        let wide = "é".repeat(MAX_ROOM_NAME_LENGTH / 2 + 1);
        assert!(validate_room_name(&wide).is_err());
    }
}
