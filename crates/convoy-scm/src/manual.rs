use convoypath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::{hash_object::hash_file, Error, GitHashes};

const PACKAGE_MANIFEST: &str = "package.json";

/// Splits raw `inputs` globs into inclusion and exclusion sets. A leading
/// `!` marks an exclusion.
fn build_globs(inputs: &[String]) -> Result<(Option<GlobSet>, Option<GlobSet>), Error> {
    if inputs.is_empty() {
        return Ok((None, None));
    }

    let mut inclusions = GlobSetBuilder::new();
    let mut exclusions = GlobSetBuilder::new();
    let mut has_inclusions = false;
    let mut has_exclusions = false;

    for input in inputs {
        if let Some(exclusion) = input.strip_prefix('!') {
            exclusions.add(Glob::new(exclusion)?);
            has_exclusions = true;
        } else {
            inclusions.add(Glob::new(input)?);
            has_inclusions = true;
        }
    }

    Ok((
        has_inclusions.then(|| inclusions.build()).transpose()?,
        has_exclusions.then(|| exclusions.build()).transpose()?,
    ))
}

/// Walks the package directory and hashes every file that survives the
/// ignore rules and the `inputs` filter. Used when there is no git index to
/// consult, and whenever `inputs` is non-empty (the index has no notion of
/// an input filter).
pub(crate) fn get_package_file_hashes_without_git(
    repo_root: &AbsoluteSystemPath,
    package_path: &AnchoredSystemPath,
    inputs: &[String],
) -> Result<GitHashes, Error> {
    hash_files_in_dir(repo_root, package_path, inputs, true)
}

/// Hashes exactly the files matching `globs` under `base_path`; nothing is
/// implicitly included. Used for repo-level global dependency declarations.
pub(crate) fn hash_files_matching_globs(
    repo_root: &AbsoluteSystemPath,
    base_path: &AnchoredSystemPath,
    globs: &[String],
) -> Result<GitHashes, Error> {
    if globs.is_empty() {
        return Ok(GitHashes::new());
    }
    hash_files_in_dir(repo_root, base_path, globs, false)
}

fn hash_files_in_dir(
    repo_root: &AbsoluteSystemPath,
    package_path: &AnchoredSystemPath,
    inputs: &[String],
    include_manifest: bool,
) -> Result<GitHashes, Error> {
    let package_dir = repo_root.resolve(package_path);
    let (inclusions, exclusions) = build_globs(inputs)?;

    let mut hashes = GitHashes::new();

    let walker = WalkBuilder::new(package_dir.as_std_path())
        .hidden(false)
        .require_git(false)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .follow_links(false)
        .build();

    for entry in walker {
        let entry = entry?;
        let file_type = entry
            .file_type()
            .expect("walk entries other than stdin have a file type");
        if file_type.is_dir() {
            // Never descend into the object database
            continue;
        }
        let absolute = AbsoluteSystemPath::from_std_path(entry.path())?;
        if absolute
            .components()
            .any(|c| c.as_str() == ".git")
        {
            continue;
        }

        let anchored = AnchoredSystemPathBuf::new(&package_dir, absolute)?;
        let unix = anchored.to_unix();

        // The manifest always participates in package hashes: it defines
        // the command being hashed, so it must invalidate even under a
        // narrow inputs filter.
        let is_manifest = include_manifest && unix.as_str() == PACKAGE_MANIFEST;
        if !is_manifest {
            if let Some(inclusions) = &inclusions {
                if !inclusions.is_match(unix.as_str()) {
                    continue;
                }
            }
            if let Some(exclusions) = &exclusions {
                if exclusions.is_match(unix.as_str()) {
                    continue;
                }
            }
        }

        let hash = hash_file(absolute)?;
        hashes.insert(unix, hash);
    }

    Ok(hashes)
}
