mod boot;
mod disk;
mod error;
mod image;
mod logger;
mod pipeline;
mod sector;
mod size;
mod symbols;

use crate::disk::DiskConfig;
use crate::pipeline::{AssembleJob, LayoutKind};
use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

fn cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("More output, repeat for trace level")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only report errors")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("sectors")
                .about("Prints the combined size of the inputs in 512-byte sectors")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("symbol")
                        .long("symbol")
                        .help("Name of the assembler constant to define")
                        .default_value(size::DEFAULT_SIZE_SYMBOL)
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("Write '<symbol> equ <sectors>' to this file instead of printing")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("pad")
                .about("Appends zeros to a file until it ends on a sector boundary")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("assemble")
                .about("Stitches boot sector and kernel into a disk image")
                .arg(
                    Arg::new("boot")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("kernel")
                        .required(true)
                        .index(2)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("symbols")
                        .short('s')
                        .long("symbols")
                        .help("Linked boot loader ELF, or its nm listing")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(layout_arg())
                .arg(
                    Arg::new("partition-table-from")
                        .long("partition-table-from")
                        .help("Keep the partition table found in this image's first sector")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("disk")
                .about("Builds a partitioned disk with an ext2 partition (needs root)")
                .arg(
                    Arg::new("build-dir")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("Defaults to <build-dir>/diskimg")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("size-mib")
                        .long("size-mib")
                        .value_parser(value_parser!(u64).range(2..))
                        .default_value("32")
                        .action(ArgAction::Set),
                )
                .arg(layout_arg())
                .arg(
                    Arg::new("user-file")
                        .long("user-file")
                        .help("File to copy into the partition, defaults to <build-dir>/shell.bin")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("mount")
                .about("Mounts the first partition of a disk image (needs root)")
                .arg(
                    Arg::new("image")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set),
                ),
        )
}

fn layout_arg() -> Arg {
    Arg::new("layout")
        .long("layout")
        .help("direct: patch the boot sector DAP; diskmap: add a location sector")
        .value_parser(["direct", "diskmap"])
        .default_value("direct")
        .action(ArgAction::Set)
}

fn layout_of(matches: &ArgMatches) -> LayoutKind {
    matches
        .get_one::<String>("layout")
        .and_then(|name| LayoutKind::from_name(name))
        .unwrap_or_default()
}

fn paths_of(matches: &ArgMatches, id: &str) -> Vec<PathBuf> {
    matches
        .get_many::<PathBuf>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("sectors", sub)) => {
            let files = paths_of(sub, "files");
            match sub.get_one::<PathBuf>("output") {
                Some(output) => {
                    let name = sub
                        .get_one::<String>("symbol")
                        .map(String::as_str)
                        .unwrap_or(size::DEFAULT_SIZE_SYMBOL);
                    size::write_symbol_file(&files, name, output)?;
                }
                None => println!("{}", size::sectors_of_files(&files)?),
            }
        }
        Some(("pad", sub)) => {
            let file = sub
                .get_one::<PathBuf>("file")
                .context("missing file argument")?;
            let added = sector::pad_file(file)?;
            log::info!("{}: appended {} bytes", file.display(), added);
        }
        Some(("assemble", sub)) => {
            let job = AssembleJob {
                boot: sub
                    .get_one::<PathBuf>("boot")
                    .cloned()
                    .context("missing boot sector argument")?,
                symbols: sub.get_one::<PathBuf>("symbols").cloned(),
                kernel: paths_of(sub, "kernel"),
                layout: layout_of(sub),
                partition_table_from: sub.get_one::<PathBuf>("partition-table-from").cloned(),
                output: sub
                    .get_one::<PathBuf>("output")
                    .cloned()
                    .context("missing output argument")?,
            };
            job.run()?;
        }
        Some(("disk", sub)) => {
            let build_dir = sub
                .get_one::<PathBuf>("build-dir")
                .context("missing build directory argument")?;
            let mut config = DiskConfig::from_build_dir(build_dir);
            if let Some(output) = sub.get_one::<PathBuf>("output") {
                config.output = output.clone();
            }
            if let Some(size_mib) = sub.get_one::<u64>("size-mib") {
                config.size_mib = *size_mib;
            }
            config.layout = layout_of(sub);
            let user_files = paths_of(sub, "user-file");
            if !user_files.is_empty() {
                config.user_files = user_files;
            }
            disk::build_disk(&config)?;
        }
        Some(("mount", sub)) => {
            let image = sub
                .get_one::<PathBuf>("image")
                .context("missing image argument")?;
            let (device, target) = disk::mount_disk(image)?;
            println!("Mounted disk image at {}", target.display());
            println!("Run this command to clean up:");
            println!(
                "sudo sh -c 'umount {}; losetup -d {}'",
                target.display(),
                device
            );
        }
        _ => unreachable!("subcommand_required is set"),
    }
    Ok(())
}

fn main() {
    let matches = cli().get_matches();
    logger::init(logger::level_from_flags(
        matches.get_count("verbose"),
        matches.get_flag("quiet"),
    ));

    if let Err(err) = run(&matches) {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_assemble_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "naos",
                "assemble",
                "build/boot.bin",
                "build/kernel.bin",
                "build/shell.bin",
                "--symbols",
                "build/boot.elf",
                "-o",
                "build/diskimg",
                "--layout",
                "diskmap",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "assemble");
        assert_eq!(
            paths_of(sub, "kernel"),
            vec![
                PathBuf::from("build/kernel.bin"),
                PathBuf::from("build/shell.bin")
            ]
        );
        assert_eq!(layout_of(sub), LayoutKind::Diskmap);
    }

    #[test]
    fn test_layout_defaults_to_direct() {
        let matches = cli()
            .try_get_matches_from(["naos", "assemble", "boot.bin", "kernel.bin", "-o", "img"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(layout_of(sub), LayoutKind::Direct);
        assert!(sub.get_one::<PathBuf>("symbols").is_none());
    }

    #[test]
    fn test_unknown_layout_rejected() {
        let result = cli().try_get_matches_from([
            "naos", "assemble", "boot.bin", "kernel.bin", "-o", "img", "--layout", "gpt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_sectors_arguments() {
        let matches = cli()
            .try_get_matches_from(["naos", "sectors", "a.bin", "b.bin", "-o", "size.inc"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(paths_of(sub, "files").len(), 2);
        assert_eq!(
            sub.get_one::<String>("symbol").map(String::as_str),
            Some(size::DEFAULT_SIZE_SYMBOL)
        );
    }
}
