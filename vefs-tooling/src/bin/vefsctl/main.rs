use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::error;

use vefs::{Archive, BackupMode, CreationMode, OpenMode};
use vefs_tooling::user_prk_from_passphrase;

fn cli() -> Command<'static> {
    Command::new("vefsctl")
        .version("0.7")
        .about("Inspect and manipulate vefs archives")
        .subcommand_required(true)
        .arg(
            Arg::new("archive")
                .long("archive")
                .short('a')
                .help("Path to the archive file.")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("passphrase")
                .long("passphrase")
                .short('p')
                .help("Passphrase the user key is derived from.")
                .takes_value(true)
                .required(true),
        )
        .subcommand(Command::new("create").about("Create a new empty archive."))
        .subcommand(Command::new("ls").about("List the files in the archive."))
        .subcommand(
            Command::new("put")
                .about("Copy a host file into the archive.")
                .arg(Arg::new("source").required(true))
                .arg(Arg::new("dest").required(true)),
        )
        .subcommand(
            Command::new("get")
                .about("Copy an archived file out to the host.")
                .arg(Arg::new("source").required(true))
                .arg(Arg::new("dest").required(true)),
        )
        .subcommand(
            Command::new("rm")
                .about("Remove a file from the archive.")
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("query")
                .about("Show metadata of an archived file.")
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("extract-all")
                .about("Extract every file below a target directory.")
                .arg(Arg::new("target").required(true)),
        )
        .subcommand(
            Command::new("validate")
                .about("Check that every stored sector still authenticates."),
        )
        .subcommand(
            Command::new("purge")
                .about("Replace corrupted sectors with zeroes.")
                .arg(
                    Arg::new("no-backup")
                        .long("no-backup")
                        .help("Delete the damaged original instead of keeping a .bak copy."),
                ),
        )
}

fn open_archive(
    matches: &ArgMatches,
    user_prk: &[u8; 32],
    mode: CreationMode,
) -> Result<Archive> {
    let path: PathBuf = matches
        .value_of("archive")
        .expect("archive is required")
        .into();
    Archive::open(&path, user_prk, mode)
        .with_context(|| format!("could not open archive {}", path.display()))
}

fn run(matches: &ArgMatches) -> Result<()> {
    let user_prk = user_prk_from_passphrase(
        matches.value_of("passphrase").expect("passphrase is required"),
    );
    let archive_path: PathBuf = matches
        .value_of("archive")
        .expect("archive is required")
        .into();

    match matches.subcommand() {
        Some(("create", _)) => {
            let archive = open_archive(
                matches,
                &user_prk,
                CreationMode::OnlyIfNotExist,
            )?;
            archive.commit()?;
            println!("created {}", archive_path.display());
        }
        Some(("ls", _)) => {
            let archive = open_archive(
                matches,
                &user_prk,
                CreationMode::OpenExisting,
            )?;
            let mut files = archive.list_files();
            files.sort();
            for path in files {
                let size = archive.query(&path)?.size;
                println!("{size:>12}  {path}");
            }
        }
        Some(("put", sub)) => {
            let source = sub.value_of("source").expect("source is required");
            let dest = sub.value_of("dest").expect("dest is required");

            let mut data = Vec::new();
            File::open(source)
                .with_context(|| format!("could not open {source}"))?
                .read_to_end(&mut data)?;

            let archive =
                open_archive(matches, &user_prk, CreationMode::IfNeeded)?;
            let file = archive.open_file(
                dest,
                OpenMode::read_write()
                    | OpenMode::CREATE
                    | OpenMode::TRUNCATE,
            )?;
            archive.write(&file, &data, 0)?;
            archive.commit()?;
            println!("stored {} bytes at {dest}", data.len());
        }
        Some(("get", sub)) => {
            let source = sub.value_of("source").expect("source is required");
            let dest = sub.value_of("dest").expect("dest is required");

            let archive = open_archive(
                matches,
                &user_prk,
                CreationMode::OpenExisting,
            )?;
            let file = archive.open_file(source, OpenMode::READ)?;
            let mut out = File::create(dest)
                .with_context(|| format!("could not create {dest}"))?;
            file.extract(&mut out)?;
            out.flush()?;
            println!(
                "extracted {} bytes to {dest}",
                archive.maximum_extent_of(&file)
            );
        }
        Some(("rm", sub)) => {
            let path = sub.value_of("path").expect("path is required");
            let archive = open_archive(
                matches,
                &user_prk,
                CreationMode::OpenExisting,
            )?;
            archive.erase(path)?;
            archive.commit()?;
            println!("removed {path}");
        }
        Some(("query", sub)) => {
            let path = sub.value_of("path").expect("path is required");
            let archive = open_archive(
                matches,
                &user_prk,
                CreationMode::OpenExisting,
            )?;
            let result = archive.query(path)?;
            println!("{path}: {} bytes, modes {:?}", result.size, result.allowed_modes);
        }
        Some(("extract-all", sub)) => {
            let target = sub.value_of("target").expect("target is required");
            let archive = open_archive(
                matches,
                &user_prk,
                CreationMode::OpenExisting,
            )?;
            archive.extract_all(target)?;
            println!("extracted archive below {target}");
        }
        Some(("validate", _)) => {
            Archive::validate(&archive_path, &user_prk)?;
            println!("archive is intact");
        }
        Some(("purge", sub)) => {
            let backup_mode = if sub.is_present("no-backup") {
                BackupMode::Delete
            } else {
                BackupMode::CloneExtents
            };
            Archive::purge_corruption(&archive_path, &user_prk, backup_mode)?;
            println!("purged corrupted sectors");
        }
        Some((unknown, _)) => {
            return Err(anyhow!("unknown subcommand '{unknown}'"));
        }
        None => unreachable!("subcommand_required is set"),
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let matches = cli().get_matches();
    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
