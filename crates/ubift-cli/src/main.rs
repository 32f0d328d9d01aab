use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use chrono::DateTime;
use clap::{Args, Parser, Subcommand};

use ubift_core::recovery::RecoveryEngine;
use ubift_core::ubifs::node::{InodeType, NodeBody};
use ubift_core::ubifs::{MountOptions, UbifsInstance};
use ubift_core::{
    parse_offset, scan_partitions, CancelToken, Geometry, Image, MtdPartition, UbiInstance,
    ROOT_INO,
};

#[derive(Parser, Debug)]
#[command(
    name = "ubift",
    version,
    about = "Forensic analysis of UBI/UBIFS flash dumps"
)]
struct Cli {
    /// Verbose diagnostics on stderr
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Flash geometry options shared by every command that touches UBI.
#[derive(Args, Debug, Clone)]
struct GeoArgs {
    /// Byte offset of the UBI partition (decimal or 0x-prefixed hex).
    /// Detected when omitted.
    #[arg(short = 'o', long, value_parser = parse_offset_arg)]
    offset: Option<u64>,

    /// PEB size in bytes; bypasses detection together with --offset
    #[arg(long, value_parser = parse_offset_arg)]
    peb_size: Option<u64>,

    /// Minimum I/O unit in bytes
    #[arg(long)]
    min_io_size: Option<u32>,
}

/// Volume selection, by name or by index within the UBI instance.
#[derive(Args, Debug, Clone)]
struct VolArgs {
    /// Volume name
    #[arg(short = 'n', long)]
    volume: Option<String>,

    /// Volume index within the instance
    #[arg(short = 'i', long)]
    vol_index: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List partitions of the dump; UBI partitions are marked as such
    Mtdls {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
    },
    /// Write the raw bytes of one partition to stdout
    Mtdcat {
        image: PathBuf,
        /// Partition index from mtdls
        index: usize,
        #[command(flatten)]
        geo: GeoArgs,
    },
    /// Write one physical erase block to stdout
    Pebcat {
        image: PathBuf,
        /// PEB index within the UBI partition
        index: u32,
        #[command(flatten)]
        geo: GeoArgs,
    },
    /// List UBI instances and their volumes
    Ubils {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
    },
    /// Write a whole UBI volume to stdout
    Ubicat {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Emit raw backing PEBs including UBI headers
        #[arg(long)]
        headers: bool,
    },
    /// List the LEB→PEB mapping of a volume
    Lebls {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
    },
    /// Write one logical erase block to stdout
    Lebcat {
        image: PathBuf,
        /// LEB number
        leb: u32,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Emit the raw backing PEB including UBI headers
        #[arg(long)]
        headers: bool,
    },
    /// Print UBIFS superblock and master-node summary
    Fsstat {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
    },
    /// List directory entries (of the root, or of a given directory inode)
    Fls {
        image: PathBuf,
        /// Directory inode to list (default: root)
        inode: Option<u32>,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Include deleted entries recovered by scanning
        #[arg(short = 'd', long)]
        deleted: bool,
        /// Render full reconstructed paths
        #[arg(short = 'p', long)]
        path: bool,
        /// List extended-attribute entries instead of children
        #[arg(short = 'x', long)]
        xentries: bool,
    },
    /// List inodes with their metadata
    Ils {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Include deleted inodes recovered by scanning
        #[arg(short = 'd', long)]
        deleted: bool,
    },
    /// Print metadata of one inode
    Istat {
        image: PathBuf,
        inode: u32,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Skip journal replay and inspect the committed state only
        #[arg(long)]
        no_replay: bool,
    },
    /// Write the content of one inode to stdout
    Icat {
        image: PathBuf,
        inode: u32,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Reassemble from the recovery scan instead of the live index
        #[arg(short = 'd', long)]
        deleted: bool,
    },
    /// Find every directory entry pointing at an inode
    Ffind {
        image: PathBuf,
        inode: u32,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
        /// Also search deleted entries recovered by scanning
        #[arg(short = 'd', long)]
        deleted: bool,
        /// Render full reconstructed paths
        #[arg(short = 'p', long)]
        path: bool,
    },
    /// List journal (bud) nodes in sequence order
    Jls {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        vol: VolArgs,
    },
    /// Extract every UBIFS volume into a directory tree
    #[command(alias = "ubift_recover")]
    Recover {
        image: PathBuf,
        /// Output directory; one subdirectory per volume
        output: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
        /// Also recover deleted files into a deleted/ subtree
        #[arg(short = 'd', long)]
        deleted: bool,
    },
    /// Aggregate recoverability statistics for the whole image
    #[command(alias = "ubift_info")]
    Info {
        image: PathBuf,
        #[command(flatten)]
        geo: GeoArgs,
    },
}

fn parse_offset_arg(raw: &str) -> Result<u64, String> {
    parse_offset(raw).map_err(|e| format!("'{raw}' is not a valid offset: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }
    run(cli.command)
}

fn geometry_of(geo: &GeoArgs) -> Option<(u64, Geometry)> {
    geo.peb_size.map(|peb_size| {
        (
            geo.offset.unwrap_or(0),
            Geometry {
                peb_size,
                min_io_size: geo.min_io_size,
            },
        )
    })
}

fn open_image(path: &PathBuf) -> Result<Image> {
    Ok(Image::open(path)?)
}

fn ubi_partition<'p>(parts: &'p [MtdPartition], geo: &GeoArgs) -> Result<&'p MtdPartition> {
    match geo.offset {
        Some(offset) => parts
            .iter()
            .find(|p| p.offset == offset && p.is_ubi())
            .ok_or_else(|| anyhow!("no UBI partition starts at {offset:#x}; see mtdls")),
        None => parts
            .iter()
            .find(|p| p.is_ubi())
            .ok_or_else(|| anyhow!("no UBI partition detected; supply --offset/--peb-size")),
    }
}

fn attach<'a>(image: &'a Image, geo: &GeoArgs) -> Result<UbiInstance<'a>> {
    let geometry = geometry_of(geo);
    let parts = scan_partitions(image, geometry);
    let part = ubi_partition(&parts, geo)?.clone();
    Ok(UbiInstance::attach(image, &part, geometry.map(|(_, g)| g))?)
}

fn select_volume<'u>(
    ubi: &'u UbiInstance<'u>,
    vol: &VolArgs,
) -> Result<ubift_core::UbiVolume<'u>> {
    if let Some(name) = &vol.volume {
        return ubi
            .volume_by_name(name)
            .ok_or_else(|| anyhow!("no volume named '{name}'; see ubils"));
    }
    if let Some(index) = vol.vol_index {
        return ubi
            .volume_by_index(index)
            .ok_or_else(|| anyhow!("no volume with index {index}; see ubils"));
    }
    // A single-volume instance needs no selector.
    match ubi.volumes().len() {
        1 => Ok(ubi.volume(ubi.volumes()[0].id).unwrap()),
        0 => bail!("the UBI instance has no volumes"),
        n => bail!("the UBI instance has {n} volumes; select one with --volume or --vol-index"),
    }
}

/// Binary output goes to stdout; a closed pipe is not an error.
fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(data).and_then(|()| stdout.flush()) {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => Ok(other?),
    }
}

fn format_time(secs: u64) -> String {
    DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn type_tag(itype: Option<InodeType>) -> &'static str {
    itype.map(|t| t.short_tag()).unwrap_or("?")
}

fn run(command: Commands) -> Result<()> {
    let cancel = CancelToken::new();
    match command {
        Commands::Mtdls { image, geo } => {
            let image = open_image(&image)?;
            let parts = scan_partitions(&image, geometry_of(&geo));
            println!("{:<6} {:>14} {:>14}  {:<10} {}", "Index", "Offset", "Length", "PEB size", "Description");
            for (i, p) in parts.iter().enumerate() {
                println!(
                    "{:<6} {:>14} {:>14}  {:<10} {}",
                    i,
                    format!("{:#x}", p.offset),
                    format!("{:#x}", p.len),
                    p.peb_size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    p.description
                );
            }
            Ok(())
        }
        Commands::Mtdcat { image, index, geo } => {
            let image = open_image(&image)?;
            let parts = scan_partitions(&image, geometry_of(&geo));
            let part = parts
                .get(index)
                .ok_or_else(|| anyhow!("partition index {index} out of range; see mtdls"))?;
            write_stdout(image.slice(part.offset, part.len)?)
        }
        Commands::Pebcat { image, index, geo } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let bytes = ubi
                .peb_bytes(index)
                .ok_or_else(|| anyhow!("PEB {index} out of range (0..{})", ubi.peb_count()))?;
            write_stdout(bytes)
        }
        Commands::Ubils { image, geo } => {
            let image = open_image(&image)?;
            let geometry = geometry_of(&geo);
            let parts = scan_partitions(&image, geometry);
            for part in parts.iter().filter(|p| p.is_ubi()) {
                if let Some(wanted) = geo.offset {
                    if part.offset != wanted {
                        continue;
                    }
                }
                let ubi = UbiInstance::attach(&image, part, geometry.map(|(_, g)| g))?;
                println!(
                    "UBI instance at {:#x}: {} PEBs of {} bytes, LEB size {}",
                    part.offset,
                    ubi.peb_count(),
                    ubi.peb_size(),
                    ubi.leb_size()
                );
                println!("  {:<4} {:<20} {:>8} {:<8} {}", "Id", "Name", "LEBs", "Type", "Flags");
                for v in ubi.volumes() {
                    println!(
                        "  {:<4} {:<20} {:>8} {:<8} {:#04x}{}",
                        v.id,
                        v.name,
                        v.leb_count,
                        v.vol_type,
                        v.flags,
                        if v.orphan { "  (orphan: missing from volume table)" } else { "" }
                    );
                }
            }
            Ok(())
        }
        Commands::Ubicat {
            image,
            geo,
            vol,
            headers,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            if headers {
                for lnum in 0..volume.leb_count() {
                    if let Some(raw) = volume.leb_with_headers(lnum) {
                        write_stdout(raw)?;
                    }
                }
                Ok(())
            } else {
                write_stdout(&volume.read_all())
            }
        }
        Commands::Lebls { image, geo, vol } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            println!("{:<8} {:<8} {:<8} {}", "LEB", "PEB", "Mapped", "Seq");
            for lnum in 0..volume.leb_count() {
                match volume.backing_peb(lnum) {
                    Some(peb) => {
                        let sqnum = ubi.pebs()[peb as usize]
                            .vid
                            .map(|v| v.sqnum.to_string())
                            .unwrap_or_else(|| "-".into());
                        println!("{:<8} {:<8} {:<8} {}", lnum, peb, "yes", sqnum);
                    }
                    None => println!("{:<8} {:<8} {:<8} {}", lnum, "-", "no", "-"),
                }
            }
            Ok(())
        }
        Commands::Lebcat {
            image,
            leb,
            geo,
            vol,
            headers,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            if leb >= volume.leb_count() {
                bail!("LEB {leb} out of range (volume has {} LEBs)", volume.leb_count());
            }
            if headers {
                let raw = volume
                    .leb_with_headers(leb)
                    .ok_or_else(|| anyhow!("LEB {leb} is not mapped; no backing PEB"))?;
                write_stdout(raw)
            } else {
                write_stdout(&volume.leb(leb))
            }
        }
        Commands::Fsstat { image, geo, vol } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount(volume)?;
            let sb = fs.superblock();
            println!("Superblock:");
            println!("  format version:   {}", sb.fmt_version);
            println!("  min I/O size:     {}", sb.min_io_size);
            println!("  LEB size:         {}", sb.leb_size);
            println!("  LEB count:        {} (max {})", sb.leb_cnt, sb.max_leb_cnt);
            println!("  log LEBs:         {}", sb.log_lebs);
            println!("  LPT LEBs:         {}", sb.lpt_lebs);
            println!("  orphan LEBs:      {}", sb.orph_lebs);
            println!("  journal heads:    {}", sb.jhead_cnt);
            println!("  index fanout:     {}", sb.fanout);
            println!("  default compr:    {}", sb.default_compr);
            println!("  UUID:             {}", format_uuid(&sb.uuid));
            let master = fs.master();
            println!("Master node (commit {}):", master.cmt_no);
            println!("  highest inode:    {}", master.highest_inum);
            println!("  log LEB:          {}", master.log_lnum);
            println!(
                "  root index:       LEB {} offset {} len {}",
                master.root_lnum, master.root_offs, master.root_len
            );
            println!("  index size:       {}", master.index_size);
            println!("  total free:       {}", master.total_free);
            println!("  total dirty:      {}", master.total_dirty);
            println!("  total used:       {}", master.total_used);
            let diag = fs.diagnostics();
            if diag.corrupt_master_copies > 0 {
                println!("Integrity issues:   {} corrupt master copy(ies)", diag.corrupt_master_copies);
            }
            if !fs.orphans().is_empty() {
                println!("Orphan inodes:      {:?}", fs.orphans());
            }
            Ok(())
        }
        Commands::Fls {
            image,
            inode,
            geo,
            vol,
            deleted,
            path,
            xentries,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount(volume)?;
            let parent = inode.unwrap_or(ROOT_INO);

            if xentries {
                println!("{:<6} {:>10} {:>10}  {}", "Type", "Inode", "Host", "Name");
                for entry in fs.list_xattr_entries(parent)? {
                    println!(
                        "{:<6} {:>10} {:>10}  {}",
                        "x",
                        entry.dent.inum,
                        entry.dent.parent(),
                        entry.dent.name_lossy()
                    );
                }
                return Ok(());
            }

            println!("{:<6} {:>10} {:>10}  {}", "Type", "Inode", "Parent", "Name");
            for entry in fs.list_dir(parent)? {
                let name = if path {
                    fs.path_of(&entry.dent)
                } else {
                    entry.dent.name_lossy()
                };
                println!(
                    "{:<6} {:>10} {:>10}  {}",
                    type_tag(entry.dent.dtype),
                    entry.dent.inum,
                    entry.dent.parent(),
                    name
                );
            }

            if deleted {
                let engine = RecoveryEngine::scan(&fs, &cancel);
                let tombstones = engine.tombstoned_names();
                for t in &tombstones {
                    if t.parent == parent {
                        println!(
                            "{:<6} {:>10} {:>10}  {} (deleted)",
                            "-", t.former_inum, t.parent, t.name
                        );
                    }
                }
                for f in engine.recovered_files()? {
                    let tombstoned = tombstones.iter().any(|t| t.former_inum == f.inum);
                    match f.parent {
                        Some(p) if p == parent && !tombstoned => println!(
                            "{:<6} {:>10} {:>10}  {} (deleted)",
                            f.itype.short_tag(),
                            f.inum,
                            p,
                            f.display_name()
                        ),
                        None if parent == ROOT_INO => println!(
                            "{:<6} {:>10} {:>10}  {} (deleted, orphan)",
                            f.itype.short_tag(),
                            f.inum,
                            "-",
                            f.display_name()
                        ),
                        _ => {}
                    }
                }
            }
            Ok(())
        }
        Commands::Ils {
            image,
            geo,
            vol,
            deleted,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount(volume)?;
            println!(
                "{:>10} {:<4} {:>12} {:>6} {:>6} {:>6}  {}",
                "Inode", "Type", "Size", "Links", "Uid", "Gid", "Modified"
            );
            for inum in fs.list_inodes()? {
                let Ok(stat) = fs.stat_inode(inum) else {
                    continue;
                };
                println!(
                    "{:>10} {:<4} {:>12} {:>6} {:>6} {:>6}  {}",
                    inum,
                    stat.node.itype().short_tag(),
                    stat.node.size,
                    stat.node.nlink,
                    stat.node.uid,
                    stat.node.gid,
                    format_time(stat.node.mtime_sec)
                );
            }
            if deleted {
                let engine = RecoveryEngine::scan(&fs, &cancel);
                for f in engine.recovered_files()? {
                    println!(
                        "{:>10} {:<4} {:>12} {:>6} {:>6} {:>6}  {} (deleted{})",
                        f.inum,
                        f.itype.short_tag(),
                        f.size,
                        0,
                        f.uid,
                        f.gid,
                        format_time(f.mtime_sec),
                        match f.source {
                            ubift_core::recovery::RecoverySource::OrphanArea => ", orphan area",
                            ubift_core::recovery::RecoverySource::StalePeb => ", stale PEB",
                            ubift_core::recovery::RecoverySource::VolumeScan => "",
                        }
                    );
                }
            }
            Ok(())
        }
        Commands::Istat {
            image,
            inode,
            geo,
            vol,
            no_replay,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount_with(
                volume,
                MountOptions {
                    replay_journal: !no_replay,
                },
            )?;
            let stat = fs.stat_inode(inode)?;
            println!("Inode:       {}", inode);
            println!("Type:        {:?}", stat.node.itype());
            println!("Size:        {}", stat.node.size);
            println!("Links:       {}", stat.node.nlink);
            println!("Uid / Gid:   {} / {}", stat.node.uid, stat.node.gid);
            println!("Mode:        {:o}", stat.node.mode);
            println!("Compression: {}", stat.node.compr_type);
            println!("Accessed:    {}", format_time(stat.node.atime_sec));
            println!("Changed:     {}", format_time(stat.node.ctime_sec));
            println!("Modified:    {}", format_time(stat.node.mtime_sec));
            println!("Sequence:    {}", stat.sqnum);
            if stat.node.is_unlinked() {
                println!("Note:        link count is zero (unlinked inode)");
            }
            if let Some(t) = fs.truncation_for(inode) {
                println!("Truncated:   to {} bytes (seq {})", t.new_size, t.sqnum);
            }
            let xattrs = fs.list_xattr_entries(inode)?;
            if !xattrs.is_empty() {
                println!("Extended attributes:");
                for x in xattrs {
                    println!("  {}", x.dent.name_lossy());
                }
            }
            Ok(())
        }
        Commands::Icat {
            image,
            inode,
            geo,
            vol,
            deleted,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount(volume)?;
            if deleted {
                let engine = RecoveryEngine::scan(&fs, &cancel);
                let file = engine
                    .recovered_file_for(inode)
                    .ok_or_else(|| anyhow!("inode {inode} was not found by the recovery scan"))?;
                let (data, partial) = engine.read_recovered(&file);
                if partial > 0 {
                    tracing::warn!("{partial} block(s) only partially decompressed");
                }
                write_stdout(&data)
            } else {
                write_stdout(&fs.read_inode(inode)?)
            }
        }
        Commands::Ffind {
            image,
            inode,
            geo,
            vol,
            deleted,
            path,
        } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount(volume)?;
            println!("{:>10} {:>10}  {}", "Parent", "Inode", "Name");
            for entry in fs.find_dentries_for(inode)? {
                let name = if path {
                    fs.path_of(&entry.dent)
                } else {
                    entry.dent.name_lossy()
                };
                println!(
                    "{:>10} {:>10}  {}",
                    entry.dent.parent(),
                    entry.dent.inum,
                    name
                );
            }
            if deleted {
                let engine = RecoveryEngine::scan(&fs, &cancel);
                for (key, versions) in &engine.outcome().dents {
                    for (sqnum, dent) in versions {
                        if dent.inum == u64::from(inode) {
                            println!(
                                "{:>10} {:>10}  {} (scanned, seq {})",
                                key.inum,
                                dent.inum,
                                dent.name_lossy(),
                                sqnum
                            );
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Jls { image, geo, vol } => {
            let image = open_image(&image)?;
            let ubi = attach(&image, &geo)?;
            let volume = select_volume(&ubi, &vol)?;
            let fs = UbifsInstance::mount(volume)?;
            let journal = fs.journal();
            if let Some(cs) = &journal.cs {
                println!("Commit-start: commit {}", cs.cmt_no);
            }
            for r in &journal.refs {
                println!("Reference:    bud LEB {} offset {} (head {})", r.lnum, r.offs, r.jhead);
            }
            println!("{:>12} {:<12} {:<10} {}", "Seq", "Type", "Location", "Key");
            for entry in &journal.entries {
                let key = match &entry.node.body {
                    NodeBody::Trun(t) => format!("inode {} -> {} bytes", t.inum, t.new_size),
                    _ => entry
                        .node
                        .key()
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "-".into()),
                };
                println!(
                    "{:>12} {:<12} {:<10} {}",
                    entry.node.header.sqnum,
                    entry.node.type_name(),
                    format!("{}:{}", entry.lnum, entry.offs),
                    key
                );
            }
            Ok(())
        }
        Commands::Recover {
            image,
            output,
            geo,
            deleted,
        } => {
            let image = open_image(&image)?;
            let reports = ubift_core::recover_image(
                &image,
                geometry_of(&geo),
                &output,
                deleted,
                &cancel,
            )?;
            if reports.is_empty() {
                bail!("no UBIFS volume found in the image");
            }
            for (volume, report) in &reports {
                println!(
                    "✅ {}: {} files, {} directories, {} deleted objects, {} bytes",
                    volume,
                    report.files_written,
                    report.directories_created,
                    report.deleted_files_written,
                    report.bytes_written
                );
                for err in &report.errors {
                    println!("  ⚠️  {err}");
                }
            }
            println!("Recovery complete: output in {}", output.display());
            Ok(())
        }
        Commands::Info { image, geo } => {
            let image = open_image(&image)?;
            let survey = ubift_core::survey_image(&image, geometry_of(&geo), &cancel)?;
            println!(
                "{} partition(s), {} UBI instance(s), {} UBIFS volume(s)",
                survey.partitions.len(),
                survey.ubi_instances,
                survey.volumes.len()
            );
            for vol in &survey.volumes {
                println!("Volume '{}':", vol.volume);
                println!("  live inodes:          {}", vol.live_inodes);
                println!("  scanned inodes:       {}", vol.scanned_inodes);
                println!("  deleted inodes:       {}", vol.deleted_inodes);
                println!("  recoverable deleted:  {}", vol.recoverable_deleted);
                println!("  tombstoned names:     {}", vol.tombstoned_names);
                println!("  orphan inodes:        {:?}", vol.orphan_inodes);
                println!("  stale PEBs:           {}", vol.stale_pebs);
                println!("  CRC failures:         {}", vol.crc_failures);
            }
            for name in &survey.unmountable_volumes {
                println!("Volume '{name}': no UBIFS instance");
            }
            Ok(())
        }
    }
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].join(""),
        hex[4..6].join(""),
        hex[6..8].join(""),
        hex[8..10].join(""),
        hex[10..16].join("")
    )
}
