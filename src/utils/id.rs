use uuid::Uuid;

/// Instance directories are named after the guest uuid; anything else under
/// the servers root is ignored during discovery.
pub fn is_instance_id(name: &str) -> bool {
    Uuid::parse_str(name).is_ok()
}

pub fn task_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}
