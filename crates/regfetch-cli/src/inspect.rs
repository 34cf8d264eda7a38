use std::io::{self, Write};

use miette::{miette, IntoDiagnostic};
use nu_ansi_term::Color::{Blue, Cyan, Green, Yellow};
use regfetch_client::{
    manifest::{Descriptor, Manifest},
    ImageDigest, ImageRef, RegistryClient,
};
use regfetch_utils::bytes::format_bytes;
use tracing::{debug, info, warn};

use crate::utils::Colored;

pub fn show_manifest(
    client: &RegistryClient,
    reference: &str,
    resolve: bool,
    raw: bool,
) -> miette::Result<()> {
    let image = ImageRef::parse(reference)?;
    let result = if resolve {
        client.fetch_image(&image)?
    } else {
        client.fetch_manifest(image.repository(), &image.reference())?
    };

    if raw {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&result.raw).into_diagnostic()?;
        return stdout.flush().into_diagnostic();
    }

    info!("{}: {}", Colored(Cyan, "Digest"), result.digest);
    info!("{}: {}", Colored(Cyan, "Media type"), result.media_type);
    info!(
        "{}: {}",
        Colored(Cyan, "Size"),
        format_bytes(result.content_length, 1)
    );

    match &result.manifest {
        Manifest::Index(index) => {
            info!("{}:", Colored(Cyan, "Manifests"));
            for entry in &index.manifests {
                let platform = entry.platform.as_ref().map_or_else(
                    || "unknown".to_string(),
                    |p| match &p.variant {
                        Some(variant) => format!("{}/{}/{}", p.os, p.architecture, variant),
                        None => format!("{}/{}", p.os, p.architecture),
                    },
                );
                info!("  {} {}", Colored(Green, platform), entry.digest);
            }
        }
        Manifest::Image(manifest) => {
            print_descriptor("Config", &manifest.config);
            let total: u64 = manifest.layers.iter().map(|l| l.size).sum();
            info!(
                "{} ({}, {}):",
                Colored(Cyan, "Layers"),
                manifest.layers.len(),
                format_bytes(total, 1)
            );
            for layer in &manifest.layers {
                print_descriptor("  -", layer);
            }
        }
    }

    Ok(())
}

fn print_descriptor(label: &str, descriptor: &Descriptor) {
    info!(
        "{} {} {} {}",
        Colored(Cyan, label),
        descriptor.digest,
        Colored(Yellow, format_bytes(descriptor.size, 1)),
        Colored(Blue, &descriptor.media_type)
    );
}

pub fn list_tags(
    client: &RegistryClient,
    repository: &str,
    page_size: Option<u32>,
    last: Option<&str>,
    all: bool,
) -> miette::Result<()> {
    if all {
        let tags = client.list_all_tags(repository, page_size)?;
        debug!("{} tags in {}", tags.len(), repository);
        for tag in tags {
            info!("{tag}");
        }
        return Ok(());
    }

    let page = client.list_tags(repository, page_size, last)?;
    for tag in &page.tags {
        info!("{tag}");
    }
    if let Some(next) = page.next {
        warn!("more tags available, continue with --last {next} or use --all");
    }
    Ok(())
}

pub fn head(
    client: &RegistryClient,
    repository: &str,
    reference: &str,
    manifest: bool,
) -> miette::Result<()> {
    if manifest {
        let head = client
            .head_manifest(repository, reference)?
            .ok_or_else(|| miette!("manifest {repository}:{reference} not found"))?;
        info!("{}: {}", Colored(Cyan, "Digest"), head.digest);
        if let Some(media_type) = head.media_type {
            info!("{}: {}", Colored(Cyan, "Media type"), media_type);
        }
        if let Some(size) = head.size {
            info!("{}: {}", Colored(Cyan, "Size"), format_bytes(size, 1));
        }
        return Ok(());
    }

    let digest = ImageDigest::parse(reference)?;
    let size = client
        .head_blob(repository, &digest)?
        .ok_or_else(|| miette!("blob {repository}@{digest} not found"))?;
    info!("{} {} ({} bytes)", digest, Colored(Yellow, format_bytes(size, 1)), size);
    Ok(())
}
