use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use securevfs::compression::{self, CompressionAlgorithm};
use securevfs::config::Config;
use securevfs::encryptor::CipherAlgorithm;
use securevfs::models::FileRecord;
use securevfs::vfs::VfsManager;
use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const ENV_USER: &str = "SVFS_USER";
const ENV_PASSWORD: &str = "SVFS_PASSWORD";
const ENV_NEW_PASSWORD: &str = "SVFS_NEW_PASSWORD";

/// svfs - encrypted, compressed virtual file system backed by SQLite
#[derive(Parser)]
#[command(name = "svfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "svfs.json")]
    config: String,

    /// User to act as (falls back to SVFS_USER)
    #[arg(short, long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a config file and create the database
    Init {
        /// Database file path
        #[arg(short, long, default_value = "./securevfs.db")]
        database: String,

        /// Cipher for new writes
        #[arg(short, long, default_value = "aes-256-gcm")]
        encryption: CipherAlgorithm,

        /// Compression algorithm for new writes
        #[arg(long, default_value = "zlib")]
        compression: CompressionAlgorithm,

        /// Compression level (defaults to the algorithm's default)
        #[arg(long)]
        level: Option<i32>,
    },

    /// Create a user
    Useradd {
        username: String,
    },

    /// Import a local file
    Put {
        /// Local file to import
        input: PathBuf,

        /// Directory path inside the VFS
        #[arg(short, long, default_value = "/")]
        path: String,

        /// Encrypt the stored content
        #[arg(short, long)]
        encrypt: bool,

        /// Compress before storing (and before encrypting)
        #[arg(short = 'z', long)]
        compress: bool,
    },

    /// Export a file's plaintext
    Get {
        file_id: i64,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List files and directories under a path
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Search file names and paths
    Find {
        query: String,
    },

    /// Remove a file
    Rm {
        file_id: i64,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Create a directory
    Mkdir {
        name: String,

        /// Containing path
        #[arg(short, long, default_value = "/")]
        path: String,

        /// Parent directory id
        #[arg(long)]
        parent: Option<i64>,
    },

    /// Remove a directory
    Rmdir {
        dir_id: i64,
    },

    /// Change how a file is stored
    Reprocess {
        file_id: i64,

        #[arg(short, long)]
        encrypt: bool,

        #[arg(short = 'z', long)]
        compress: bool,
    },

    /// Change the password and re-key encrypted files
    Passwd,

    /// Show configuration and storage statistics
    Status,

    /// Compress a local file outside the VFS
    Compress {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long, default_value = "zlib")]
        algorithm: CompressionAlgorithm,

        /// Compression level (defaults to the algorithm's default)
        #[arg(long)]
        level: Option<i32>,
    },

    /// Decompress a local file produced by `compress`
    Decompress {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long, default_value = "zlib")]
        algorithm: CompressionAlgorithm,
    },

    /// Encrypt a local file under the user's key
    Encrypt {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long, default_value = "aes-256-gcm")]
        algorithm: CipherAlgorithm,
    },

    /// Decrypt a local file produced by `encrypt`
    Decrypt {
        input: PathBuf,
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=info,securevfs=debug
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "svfs starting");

    match &cli.command {
        Commands::Init {
            database,
            encryption,
            compression,
            level,
        } => cmd_init(&cli.config, database, *encryption, *compression, *level).await,

        Commands::Useradd { username } => cmd_useradd(&cli.config, username),

        Commands::Put {
            input,
            path,
            encrypt,
            compress,
        } => {
            let vfs = login(&cli)?;
            cmd_put(&vfs, input, path, *encrypt, *compress).await
        }

        Commands::Get { file_id, output } => {
            let vfs = login(&cli)?;
            cmd_get(&vfs, *file_id, output.as_deref()).await
        }

        Commands::Ls { path, verbose } => cmd_ls(&login(&cli)?, path, *verbose),

        Commands::Find { query } => cmd_find(&login(&cli)?, query),

        Commands::Rm { file_id, yes } => cmd_rm(&login(&cli)?, *file_id, *yes),

        Commands::Mkdir { name, path, parent } => {
            let vfs = login(&cli)?;
            let id = vfs.create_directory(name, path, *parent)?;
            println!("Created directory '{}' (id {})", name, id);
            Ok(())
        }

        Commands::Rmdir { dir_id } => {
            let vfs = login(&cli)?;
            vfs.delete_directory(*dir_id)?;
            println!("Removed directory {}", dir_id);
            Ok(())
        }

        Commands::Reprocess {
            file_id,
            encrypt,
            compress,
        } => {
            let vfs = login(&cli)?;
            let spinner = create_spinner(&format!("Reprocessing file {}...", file_id));
            vfs.reprocess_file(*file_id, *encrypt, *compress)?;
            spinner.finish_with_message(format!(
                "File {} now stored with encrypt={} compress={}",
                file_id, encrypt, compress
            ));
            Ok(())
        }

        Commands::Passwd => cmd_passwd(&cli),

        Commands::Status => cmd_status(&cli),

        Commands::Compress {
            input,
            output,
            algorithm,
            level,
        } => {
            let level = level.unwrap_or_else(|| algorithm.default_level());
            let written = compression::compress_file(input, output, *algorithm, level)
                .await
                .with_context(|| format!("compressing {:?}", input))?;
            println!(
                "{} -> {} ({} bytes, {})",
                input.display(),
                output.display(),
                written,
                algorithm.effective()
            );
            Ok(())
        }

        Commands::Decompress {
            input,
            output,
            algorithm,
        } => {
            let written = compression::decompress_file(input, output, *algorithm)
                .await
                .with_context(|| format!("decompressing {:?}", input))?;
            println!("{} -> {} ({} bytes)", input.display(), output.display(), written);
            Ok(())
        }

        Commands::Encrypt {
            input,
            output,
            algorithm,
        } => {
            let vfs = login(&cli)?;
            let written = vfs
                .encryptor()
                .encrypt_file(input, output, *algorithm)
                .await
                .with_context(|| format!("encrypting {:?}", input))?;
            println!(
                "{} -> {} ({} bytes, {})",
                input.display(),
                output.display(),
                written,
                algorithm
            );
            Ok(())
        }

        Commands::Decrypt { input, output } => {
            let vfs = login(&cli)?;
            let written = vfs
                .encryptor()
                .decrypt_file(input, output)
                .await
                .with_context(|| format!("decrypting {:?}", input))?;
            println!("{} -> {} ({} bytes)", input.display(), output.display(), written);
            Ok(())
        }
    }
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}: ", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_secret(env_var: &str, label: &str) -> Result<String> {
    match env::var(env_var) {
        Ok(value) => Ok(value),
        Err(_) => prompt(label),
    }
}

fn username(cli: &Cli) -> Result<String> {
    cli.user
        .clone()
        .or_else(|| env::var(ENV_USER).ok())
        .context("no user given; pass --user or set SVFS_USER")
}

fn open_vfs(config_path: &str) -> Result<(Config, VfsManager)> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vfs = VfsManager::open(&cfg.database_path, cfg.pipeline_settings())
        .with_context(|| format!("opening database '{}'", cfg.database_path))?;
    Ok((cfg, vfs))
}

/// Open the configured database and log in; returns the password used.
fn login_with_password(cli: &Cli) -> Result<(VfsManager, String)> {
    let (_, mut vfs) = open_vfs(&cli.config)?;
    let user = username(cli)?;
    let password = read_secret(ENV_PASSWORD, "Password")?;

    let spinner = create_spinner("Unlocking...");
    let result = vfs.authenticate(&user, &password).map(|_| ());
    spinner.finish_and_clear();
    result.with_context(|| format!("logging in as '{}'", user))?;
    Ok((vfs, password))
}

fn login(cli: &Cli) -> Result<VfsManager> {
    login_with_password(cli).map(|(vfs, _)| vfs)
}

fn display_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

async fn cmd_init(
    config_path: &str,
    database: &str,
    encryption: CipherAlgorithm,
    compression: CompressionAlgorithm,
    level: Option<i32>,
) -> Result<()> {
    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    let cfg = Config {
        database_path: database.to_string(),
        encryption_algorithm: encryption,
        compression_algorithm: compression,
        compression_level: level.unwrap_or_else(|| compression.default_level()),
    };
    cfg.validate()?;

    VfsManager::open(&cfg.database_path, cfg.pipeline_settings())
        .with_context(|| format!("creating database '{}'", cfg.database_path))?;
    cfg.save(config_path)?;

    println!("Initialization complete!");
    println!("Config:      {}", config_path);
    println!("Database:    {}", cfg.database_path);
    println!("Encryption:  {}", cfg.encryption_algorithm);
    println!("Compression: {} (level {})", cfg.compression_algorithm, cfg.compression_level);
    Ok(())
}

fn cmd_useradd(config_path: &str, username: &str) -> Result<()> {
    let (_, vfs) = open_vfs(config_path)?;
    let password = read_secret(ENV_PASSWORD, "New password")?;
    if env::var(ENV_PASSWORD).is_err() {
        let confirm = prompt("Repeat password")?;
        if confirm != password {
            anyhow::bail!("passwords do not match");
        }
    }
    let id = vfs.create_user(username, &password)?;
    println!("Created user '{}' (id {})", username, id);
    Ok(())
}

async fn cmd_put(
    vfs: &VfsManager,
    input: &Path,
    path: &str,
    encrypt: bool,
    compress: bool,
) -> Result<()> {
    let spinner = create_spinner(&format!("Importing {}...", input.display()));
    let id = vfs
        .import_file(input, path, encrypt, compress)
        .await
        .with_context(|| format!("importing {:?}", input))?;
    let record = vfs.get_file(id)?;
    spinner.finish_with_message(format!(
        "Stored {} bytes as file {} ({} on disk)",
        record.size,
        id,
        record.content.stored_len()
    ));
    println!("  {} -> {}", input.display(), display_path(path, &record.filename));
    Ok(())
}

async fn cmd_get(vfs: &VfsManager, file_id: i64, output: Option<&Path>) -> Result<()> {
    match output {
        Some(output_path) => {
            let spinner = create_spinner(&format!("Exporting file {}...", file_id));
            let bytes = vfs.export_file(file_id, output_path).await?;
            spinner.finish_with_message(format!("Exported {} bytes -> {:?}", bytes, output_path));
        }
        None => {
            let data = vfs.get_file_content(file_id)?;
            io::stdout().write_all(&data)?;
            eprintln!("Read {} bytes to stdout", data.len());
        }
    }
    Ok(())
}

fn print_file(file: &FileRecord, verbose: bool) {
    if verbose {
        let compression = file
            .compression
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        let checksum = hex::encode(&file.checksum[..file.checksum.len().min(8)]);
        println!(
            "{:>6} {:<32} {:>12} {:>12} {:>5} {:>6} {:<24} {:<16} {}",
            file.id,
            file.filename,
            file.size,
            file.content.stored_len(),
            if file.is_encrypted() { "yes" } else { "no" },
            compression,
            file.mime_type,
            checksum,
            file.modified_at.format("%Y-%m-%d %H:%M:%S"),
        );
    } else {
        println!(
            "  [{}] {} ({} bytes)",
            file.id,
            display_path(&file.path, &file.filename),
            file.size
        );
    }
}

fn cmd_ls(vfs: &VfsManager, path: &str, verbose: bool) -> Result<()> {
    let dirs = vfs.list_directories_in_path(path)?;
    let files = vfs.list_files_in_directory(path)?;

    if dirs.is_empty() && files.is_empty() {
        println!("Nothing under '{}'", path);
        return Ok(());
    }

    for dir in &dirs {
        println!("  [{}] {}/", dir.id, dir.name);
    }
    if verbose && !files.is_empty() {
        println!(
            "{:>6} {:<32} {:>12} {:>12} {:>5} {:>6} {:<24} {:<16} {}",
            "ID", "FILENAME", "SIZE", "STORED", "ENC", "COMP", "MIME", "SHA256", "MODIFIED"
        );
    }
    for file in &files {
        print_file(file, verbose);
    }
    Ok(())
}

fn cmd_find(vfs: &VfsManager, query: &str) -> Result<()> {
    let files = vfs.search_files(query)?;
    if files.is_empty() {
        println!("No files match '{}'", query);
        return Ok(());
    }
    println!("{} match(es):", files.len());
    for file in &files {
        print_file(file, false);
    }
    Ok(())
}

fn cmd_rm(vfs: &VfsManager, file_id: i64, yes: bool) -> Result<()> {
    let record = vfs.get_file(file_id)?;

    if !yes {
        print!(
            "Delete '{}'? This cannot be undone. [y/N]: ",
            display_path(&record.path, &record.filename)
        );
        io::stdout().flush()?;

        let mut response = String::new();
        io::stdin().read_line(&mut response)?;

        if !response.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    vfs.delete_file(file_id)?;
    println!("Deleted '{}'", record.filename);
    Ok(())
}

fn cmd_passwd(cli: &Cli) -> Result<()> {
    let (mut vfs, old) = login_with_password(cli)?;
    let new = read_secret(ENV_NEW_PASSWORD, "New password")?;

    let spinner = create_spinner("Re-keying encrypted files...");
    let result = vfs.change_password(&old, &new);
    spinner.finish_and_clear();
    result.context("changing password")?;
    println!("Password changed");
    Ok(())
}

fn cmd_status(cli: &Cli) -> Result<()> {
    let (cfg, _) = open_vfs(&cli.config)?;

    println!("svfs status");
    println!();
    println!("Configuration:");
    println!("  Config file:   {}", cli.config);
    println!("  Database:      {}", cfg.database_path);
    println!("  Encryption:    {}", cfg.encryption_algorithm);
    println!(
        "  Compression:   {} (level {}, effective {})",
        cfg.compression_algorithm,
        cfg.compression_level,
        cfg.compression_algorithm.effective()
    );

    if cli.user.is_none() && env::var(ENV_USER).is_err() {
        return Ok(());
    }

    let vfs = login(cli)?;
    let stats = vfs.storage_stats()?;
    let files = vfs
        .store()
        .list_user_files(vfs.current_user().map(|u| u.id).unwrap_or_default())?;
    let encrypted = files.iter().filter(|f| f.is_encrypted()).count();
    let compressed = files.iter().filter(|f| f.is_compressed()).count();
    let stored: usize = files.iter().map(|f| f.content.stored_len()).sum();

    println!();
    println!("Storage Statistics:");
    println!("  Files:         {}", stats.file_count);
    println!("  Directories:   {}", stats.directory_count);
    println!(
        "  Total size:    {} bytes ({:.2} MB)",
        stats.total_bytes,
        stats.total_bytes as f64 / 1_048_576.0
    );
    println!("  Stored size:   {} bytes", stored);
    println!("  Encrypted:     {}/{}", encrypted, stats.file_count);
    println!("  Compressed:    {}/{}", compressed, stats.file_count);
    Ok(())
}
