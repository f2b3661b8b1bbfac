//! tpmtok CLI — manage TPM-backed token directories
//!
//! Commands:
//!   tpmtok init        — load (creating if needed) a token and wait for its key hierarchy
//!   tpmtok list        — list the objects stored in a token
//!   tpmtok change-auth — change a token's authorization data
//!   tpmtok demo        — encrypt and decrypt with a fresh AES key on a temporary token

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tpmtok_core::mechanism::{CKM_AES_CBC_PAD, CKM_AES_KEY_GEN};
use tpmtok_core::object::{
    Object, CKA_CLASS, CKA_LABEL, CKA_PRIVATE, CKA_TOKEN, CKA_VALUE_LEN, CKO_CERTIFICATE, CKO_DATA, CKO_PRIVATE_KEY,
    CKO_PUBLIC_KEY, CKO_SECRET_KEY,
};
use tpmtok_core::{
    Attribute, OperationType, PrivateLoadState, ServiceConfig, SlotId, SlotManager, TokenError, TokenResult,
    DEFAULT_ISOLATE,
};

const LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const FIND_BATCH: usize = 32;

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        tpmtok — TPM-backed PKCS#11 token service            ║
╚══════════════════════════════════════════════════════════════╝

Usage: tpmtok <command> [options]

Commands:
  init        <dir> <auth> [label]     Load a token, creating its key hierarchy if needed
  list        <dir> <auth>             List the objects in a token
  change-auth <dir> <old> <new>        Change a token's authorization data
  demo                                 AES-256 CBC_PAD round trip on a temporary token

Environment:
  TPMTOK_CONFIG        path to a JSON service config
  TPMTOK_TPM_BACKEND   simulated | stub
  TPMTOK_LEGACY_PIN    PIN accepted by login for legacy clients
  RUST_LOG             log filter (default: info)

Examples:
  tpmtok init ~/.tpmtok/user secret "user token"
  tpmtok list ~/.tpmtok/user secret
  tpmtok change-auth ~/.tpmtok/user secret new-secret
  tpmtok demo
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "init" => cmd_init(&args[2..]).await,
        "list" => cmd_list(&args[2..]).await,
        "change-auth" => cmd_change_auth(&args[2..]).await,
        "demo" => cmd_demo().await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {} (CKR {:#x})", e, e.code());
        std::process::exit(1);
    }
}

fn open_manager() -> TokenResult<Arc<SlotManager>> {
    let config = ServiceConfig::from_env().map_err(|e| TokenError::ArgumentsBad(e.to_string()))?;
    let manager = SlotManager::new(config)?;
    if !manager.is_tpm_available() {
        println!("  No TPM available: private objects will not be accessible");
    }
    Ok(Arc::new(manager))
}

/// Load the token and block (off the runtime) until its private objects settle
async fn load_and_wait(manager: &Arc<SlotManager>, dir: &Path, auth: &str, label: &str) -> TokenResult<SlotId> {
    let slot = manager.load_token(&DEFAULT_ISOLATE, dir, auth.as_bytes(), label)?;
    let waiter = manager.clone();
    let state = tokio::task::spawn_blocking(move || waiter.wait_for_token(&DEFAULT_ISOLATE, slot, LOAD_TIMEOUT))
        .await
        .map_err(|e| TokenError::GeneralError(format!("wait task: {}", e)))??;

    match state {
        PrivateLoadState::Ready => println!("  Private objects ready"),
        PrivateLoadState::Failed => println!("  Private objects unavailable (see log)"),
        PrivateLoadState::Pending => println!("  Timed out waiting for private objects"),
    }
    Ok(slot)
}

async fn cmd_init(args: &[String]) -> TokenResult<()> {
    if args.len() < 2 {
        eprintln!("Usage: tpmtok init <dir> <auth> [label]");
        return Ok(());
    }
    let dir = PathBuf::from(&args[0]);
    let label = args.get(2).map(String::as_str).unwrap_or("tpmtok");

    let manager = open_manager()?;
    let slot = load_and_wait(&manager, &dir, &args[1], label).await?;
    let info = manager.get_token_info(&DEFAULT_ISOLATE, slot)?;
    println!("  Token loaded in slot {}", slot);
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn cmd_list(args: &[String]) -> TokenResult<()> {
    if args.len() < 2 {
        eprintln!("Usage: tpmtok list <dir> <auth>");
        return Ok(());
    }
    let dir = PathBuf::from(&args[0]);

    let manager = open_manager()?;
    let slot = load_and_wait(&manager, &dir, &args[1], "tpmtok").await?;
    let handle = manager.open_session(&DEFAULT_ISOLATE, slot, true)?;
    let shared = manager.get_session(&DEFAULT_ISOLATE, handle)?;

    let mut rows = Vec::new();
    {
        let mut session = shared.lock();
        session.find_objects_init(&[Attribute::bool(CKA_TOKEN, true)])?;
        loop {
            let batch = session.find_objects(FIND_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for object_handle in batch {
                let attrs = session.get_attribute_value(object_handle, &[CKA_CLASS, CKA_PRIVATE, CKA_LABEL])?;
                let object = Object::from_template(&attrs);
                rows.push((
                    object_handle,
                    class_name(object.class()),
                    object.is_private(),
                    session.object_label(object_handle)?,
                ));
            }
        }
        session.find_objects_final()?;
    }
    manager.close_session(&DEFAULT_ISOLATE, handle)?;

    println!("  {} objects in {}", rows.len(), dir.display());
    println!("{}", "-".repeat(60));
    for (object_handle, class, private, label) in rows {
        println!(
            "  {:>6}  {:<12} {:<8} {}",
            object_handle,
            class,
            if private { "private" } else { "public" },
            label
        );
    }
    Ok(())
}

fn class_name(class: Option<u64>) -> &'static str {
    match class {
        Some(CKO_DATA) => "data",
        Some(CKO_CERTIFICATE) => "certificate",
        Some(CKO_PUBLIC_KEY) => "public-key",
        Some(CKO_PRIVATE_KEY) => "private-key",
        Some(CKO_SECRET_KEY) => "secret-key",
        Some(_) => "other",
        None => "unknown",
    }
}

async fn cmd_change_auth(args: &[String]) -> TokenResult<()> {
    if args.len() < 3 {
        eprintln!("Usage: tpmtok change-auth <dir> <old> <new>");
        return Ok(());
    }
    let manager = open_manager()?;
    manager.change_token_auth_data(Path::new(&args[0]), args[1].as_bytes(), args[2].as_bytes())?;
    println!("  Authorization data changed for {}", args[0]);
    Ok(())
}

async fn cmd_demo() -> TokenResult<()> {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║              tpmtok — AES-256 CBC_PAD demo                  ║
╚══════════════════════════════════════════════════════════════╝
"#
    );

    let dir = env::temp_dir().join(format!("tpmtok-demo-{}", uuid::Uuid::new_v4()));
    let result = run_demo(&dir).await;
    let _ = std::fs::remove_dir_all(&dir);
    result
}

async fn run_demo(dir: &Path) -> TokenResult<()> {
    println!("Step 1: Loading a temporary token...");
    println!("{}", "-".repeat(60));
    let manager = open_manager()?;
    let slot = load_and_wait(&manager, dir, "demo-auth", "demo").await?;
    println!("  Slot {} -> {}", slot, dir.display());

    println!("\nStep 2: Generating an AES-256 session key...");
    println!("{}", "-".repeat(60));
    let handle = manager.open_session(&DEFAULT_ISOLATE, slot, false)?;
    let shared = manager.get_session(&DEFAULT_ISOLATE, handle)?;
    let mut session = shared.lock();
    let key = session.generate_key(
        CKM_AES_KEY_GEN,
        &[Attribute::ulong(CKA_VALUE_LEN, 32), Attribute::bool(CKA_TOKEN, false)],
    )?;
    println!("  Key handle {}", key);

    println!("\nStep 3: Encrypting 22 bytes in two buffered calls...");
    println!("{}", "-".repeat(60));
    let iv = session.generate_random(16)?;
    let plaintext = vec![b'B'; 22];
    session.operation_init(OperationType::Encrypt, CKM_AES_CBC_PAD, &iv, Some(key))?;

    let first = match session.operation_update(OperationType::Encrypt, &plaintext, 0) {
        Err(e) if e.is_recoverable() => {
            let required = e.required_len().unwrap_or_default();
            println!("  Update asked for {} bytes of output", required);
            session.operation_update(OperationType::Encrypt, &plaintext, required)?
        }
        other => other?,
    };
    let second = match session.operation_final(OperationType::Encrypt, 0) {
        Err(e) if e.is_recoverable() => {
            let required = e.required_len().unwrap_or_default();
            println!("  Final asked for {} bytes of output", required);
            session.operation_final(OperationType::Encrypt, required)?
        }
        other => other?,
    };
    let ciphertext = [first, second].concat();
    println!("  Ciphertext ({} bytes): {}", ciphertext.len(), hex::encode(&ciphertext));

    println!("\nStep 4: Decrypting in a single call...");
    println!("{}", "-".repeat(60));
    session.operation_init(OperationType::Decrypt, CKM_AES_CBC_PAD, &iv, Some(key))?;
    let recovered = session.operation_single_part(OperationType::Decrypt, &ciphertext, ciphertext.len())?;
    println!("  Recovered: {}", String::from_utf8_lossy(&recovered));
    drop(session);

    manager.close_session(&DEFAULT_ISOLATE, handle)?;
    manager.unload_token(&DEFAULT_ISOLATE, dir)?;

    if recovered != plaintext {
        return Err(TokenError::GeneralError("round trip mismatch".into()));
    }
    println!("\n  Round trip OK");
    Ok(())
}
