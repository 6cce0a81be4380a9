use conglomdb::AccessManager;
use conglomdb::catalog::ConglomerateId;
use conglomdb::config::AccessConfig;
use conglomdb::conglomerate::decode_envelope;
use conglomdb::property::secret::ENCRYPTED_BOOT_PASSWORD;
use conglomdb::raw::image::{
    BACKUP_MANIFEST_FILE, IMAGE_FILE, load_backup_manifest, read_image, verify_backup,
};
use std::fs;
use std::path::PathBuf;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "backup" => match args.get(2).map(String::as_str) {
            Some("list") => cmd_backup_list(&args[3..]),
            Some("verify") => cmd_backup_verify(&args[3..]),
            Some(other) => Err(format!("unknown backup command: {other}")),
            None => Err("missing backup subcommand".into()),
        },
        "image" => match args.get(2).map(String::as_str) {
            Some("containers") => cmd_image_containers(&args[3..]),
            Some(other) => Err(format!("unknown image command: {other}")),
            None => Err("missing image subcommand".into()),
        },
        "properties" => cmd_properties(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_backup_list(args: &[String]) -> Result<(), String> {
    let root = parse_flag_value(args, "--root").ok_or("--root is required")?;
    let root = PathBuf::from(root);

    let mut entries = fs::read_dir(&root)
        .map_err(|e| format!("read_dir {}: {e}", root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let dir = entry.path();
        if !dir.join(BACKUP_MANIFEST_FILE).exists() {
            continue;
        }
        match load_backup_manifest(&dir) {
            Ok(m) => println!(
                "{}\t{}\t{}\t{}\t{}",
                dir.display(),
                m.created_at_micros,
                m.container_count,
                m.max_container_id,
                m.size_bytes
            ),
            Err(err) => println!("{}\tINVALID\t{}", dir.display(), err),
        }
    }
    Ok(())
}

fn cmd_backup_verify(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--backup-dir").ok_or("--backup-dir is required")?;
    let (manifest, image) =
        verify_backup(&PathBuf::from(&dir)).map_err(|e| format!("verify {dir}: {e}"))?;
    println!(
        "ok\t{}\t{} containers\t{} rows",
        manifest.sha256_hex,
        image.containers.len(),
        image.containers.iter().map(|c| c.rows.len()).sum::<usize>()
    );
    Ok(())
}

fn cmd_image_containers(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let path = PathBuf::from(&dir).join(IMAGE_FILE);
    let image = read_image(&path).map_err(|e| format!("read {}: {e}", path.display()))?;
    println!("max_container_id\t{}", image.max_container_id);
    for container in &image.containers {
        let id = ConglomerateId(container.key.container_id);
        let format = match decode_envelope(&container.metadata) {
            Ok((format, _)) => format.to_string(),
            Err(err) => format!("undecodable ({err})"),
        };
        println!(
            "{}\tkind={}\tseq={}\tformat={}\trows={}",
            container.key,
            id.kind_tag(),
            id.sequence(),
            format,
            container.rows.len()
        );
    }
    Ok(())
}

/// Boots the store read-only and prints every visible property, service
/// properties included, as one JSON object.
fn cmd_properties(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let mut config = AccessConfig::default().with_data_dir(&dir);
    config.read_only = true;
    if let Some(password) = parse_flag_value(args, "--boot-password") {
        config = config.with_boot_password(password);
    }
    let manager = AccessManager::boot(config).map_err(|e| format!("boot {dir}: {e}"))?;
    let tx = manager
        .get_read_only_transaction("congdir")
        .map_err(|e| e.to_string())?;
    let properties = tx.get_properties().map_err(|e| e.to_string())?;
    tx.destroy().map_err(|e| e.to_string())?;

    let mut out = serde_json::Map::new();
    for (key, value) in properties {
        out.insert(key, serde_json::Value::String(value.to_string()));
    }
    let image = read_image(&PathBuf::from(&dir).join(IMAGE_FILE)).map_err(|e| e.to_string())?;
    for (key, value) in image.service_properties {
        if key == ENCRYPTED_BOOT_PASSWORD {
            continue;
        }
        out.insert(key, serde_json::Value::String(value));
    }
    let rendered = serde_json::to_string_pretty(&serde_json::Value::Object(out))
        .map_err(|e| e.to_string())?;
    println!("{rendered}");
    manager.shutdown().map_err(|e| e.to_string())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  congdir backup list --root <backup-root>");
    eprintln!("  congdir backup verify --backup-dir <backup-dir>");
    eprintln!("  congdir image containers --data-dir <store-dir>");
    eprintln!("  congdir properties --data-dir <store-dir> [--boot-password <password>]");
}
