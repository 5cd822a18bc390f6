use uuid::Uuid;

/// `<prefix>_<32 lowercase hex digits>`: `msg` for messages and
/// `conv` for conversations.
pub fn create_object_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}
