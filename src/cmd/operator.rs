//! Database and operator account commands: `master-control init-db`,
//! `add-operator` and `hash-password`.

use std::io::BufRead;

use anyhow::{Context, Result, bail};

use master_control::config::MasterConfig;
use master_control::master::auth::hash_password;
use master_control::master::models::Role;
use master_control::master::server::open_db;

fn read_password(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password.to_string())
}

pub fn cmd_init_db(config: &MasterConfig) -> Result<()> {
    open_db(config)?;
    println!("Database initialized at {}", config.server.db_path.display());
    Ok(())
}

pub fn cmd_add_operator(
    config: &MasterConfig,
    email: &str,
    role: Role,
    name: Option<&str>,
    input: impl BufRead,
) -> Result<()> {
    let email = email.trim();
    if !email.contains('@') {
        bail!("Invalid email address: {}", email);
    }
    let password = read_password(input)?;

    let db = open_db(config)?;
    let db = db.lock_sync()?;
    if db.find_operator_by_email(email)?.is_some() {
        bail!("Operator {} already exists", email);
    }
    let hash = hash_password(&password)?;
    let operator = db.create_operator(email, name, role, &hash)?;
    tracing::info!(user_id = operator.id, "operator created");

    println!(
        "Created operator {} (id {}, role {})",
        operator.email,
        operator.id,
        operator.role.as_str()
    );
    Ok(())
}

pub fn cmd_hash_password(input: impl BufRead) -> Result<()> {
    let password = read_password(input)?;
    println!("{}", hash_password(&password)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_password_strips_line_ending() {
        assert_eq!(read_password("s3cret\r\n".as_bytes()).unwrap(), "s3cret");
        assert_eq!(read_password(" spaced \n".as_bytes()).unwrap(), " spaced ");
        assert!(read_password("\n".as_bytes()).is_err());
        assert!(read_password("".as_bytes()).is_err());
    }

    #[test]
    fn test_add_operator_rejects_duplicates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = MasterConfig::default();
        config.server.db_path = tmp.path().join("master.db");

        cmd_add_operator(&config, "ops@example.com", Role::Master, None, "pw\n".as_bytes())
            .unwrap();
        let err = cmd_add_operator(&config, "OPS@example.com", Role::Admin, None, "pw\n".as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(cmd_add_operator(&config, "nobody", Role::Admin, None, "pw\n".as_bytes()).is_err());
    }
}
