use std::{fs, path::Path, time::Instant};

use miette::IntoDiagnostic;
use nu_ansi_term::Color::{Cyan, Green, Red, Yellow};
use rayon::prelude::*;
use regfetch_client::{
    manifest::Descriptor, BlobRequest, BlobResult, BlobSource, ImageDigest, ImageRef,
    RegistryClient,
};
use regfetch_utils::{bytes::format_bytes, fs::ensure_dir_exists, time::format_duration};
use tracing::{error, info};

use crate::utils::{parse_range, Colored};

pub fn fetch_blob(
    client: &RegistryClient,
    repository: &str,
    digest: &str,
    output: &Path,
    size: Option<u64>,
    range: Option<&str>,
) -> miette::Result<()> {
    let digest = ImageDigest::parse(digest)?;

    if let Some(range) = range {
        let (start, end) = parse_range(range)?;
        let bytes = client.fetch_blob_range(repository, &digest, start, end)?;
        fs::write(output, &bytes).into_diagnostic()?;
        info!(
            "Wrote {} of {} to {}",
            format_bytes(bytes.len() as u64, 1),
            digest,
            output.display()
        );
        return Ok(());
    }

    let mut request = BlobRequest::new(repository, digest);
    if let Some(size) = size {
        request = request.with_size(size);
    }
    let result = client.fetch_blob(&request, output)?;
    report(&result);
    Ok(())
}

pub fn pull_image(client: &RegistryClient, reference: &str, output: &Path) -> miette::Result<()> {
    let started = Instant::now();
    let image = ImageRef::parse(reference)?;
    let repository = image.repository();
    ensure_dir_exists(output).into_diagnostic()?;

    let manifest = client.fetch_image(&image)?;
    fs::write(output.join("manifest.json"), &manifest.raw).into_diagnostic()?;
    info!("Pulling {} ({})", image, Colored(Cyan, &manifest.digest));

    let config = client.fetch_config(repository, &manifest.manifest, &output.join("config.json"))?;
    report(&config);

    let layers = manifest.manifest.layers();
    let results: Vec<_> = layers
        .par_iter()
        .map(|layer| {
            let target = output.join(layer_file_name(layer));
            client.fetch_blob(&BlobRequest::from_descriptor(repository, layer), &target)
        })
        .collect();

    let mut fetched = vec![config];
    let mut first_error = None;
    for (layer, result) in layers.iter().zip(results) {
        match result {
            Ok(result) => {
                report(&result);
                fetched.push(result);
            }
            Err(err) => {
                error!("{} {}: {}", Colored(Red, "failed"), layer.digest, err);
                first_error.get_or_insert(err);
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err.into());
    }

    let transferred: u64 = fetched.iter().map(|r| r.bytes_transferred).sum();
    let reused = fetched
        .iter()
        .filter(|r| r.source != BlobSource::Origin)
        .count();
    info!(
        "{} {} blobs into {} in {} ({} downloaded, {} reused)",
        Colored(Green, "Pulled"),
        fetched.len(),
        output.display(),
        format_duration(started.elapsed()),
        format_bytes(transferred, 1),
        reused
    );
    Ok(())
}

fn report(result: &BlobResult) {
    info!(
        "{} {} {} from {}",
        result.digest,
        Colored(Yellow, format_bytes(result.size, 1)),
        result.path.display(),
        Colored(Cyan, result.source)
    );
}

/// The layer's title annotation when it is a plain file name, else its digest hex.
fn layer_file_name(layer: &Descriptor) -> String {
    match layer.title() {
        Some(title)
            if !title.is_empty()
                && title != "."
                && title != ".."
                && !title.contains(['/', '\\', '\0'])
                && title != "manifest.json"
                && title != "config.json" =>
        {
            title.to_string()
        }
        _ => layer.digest.hex().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(title: Option<&str>) -> Descriptor {
        let mut json = serde_json::json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
            "size": 3
        });
        if let Some(title) = title {
            json["annotations"] =
                serde_json::json!({ "org.opencontainers.image.title": title });
        }
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_layer_file_name() {
        let hex = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

        assert_eq!(layer_file_name(&layer(None)), hex);
        assert_eq!(layer_file_name(&layer(Some("rootfs.tar.gz"))), "rootfs.tar.gz");
        assert_eq!(layer_file_name(&layer(Some("../etc/passwd"))), hex);
        assert_eq!(layer_file_name(&layer(Some(".."))), hex);
        assert_eq!(layer_file_name(&layer(Some("config.json"))), hex);
    }
}
