use std::{env, iter::Peekable, path::PathBuf, str::Chars};

use crate::error::{PathError, PathResult};

/// Resolves a user-supplied path.
///
/// Expands `$VAR` and `${VAR}`, turns a leading `~` into the home directory
/// and makes relative paths absolute against the current directory.
///
/// # Errors
///
/// * [`PathError::Empty`] if the path is empty
/// * [`PathError::CurrentDir`] if the current directory cannot be determined
/// * [`PathError::MissingEnvVar`] if a referenced variable is undefined
/// * [`PathError::UnclosedVariable`] for `${` without a closing brace
///
/// # Example
///
/// ```no_run
/// use regfetch_utils::path::resolve_path;
///
/// let cache = resolve_path("$XDG_CACHE_HOME/regfetch").unwrap();
/// assert!(cache.is_absolute());
/// ```
pub fn resolve_path(path: &str) -> PathResult<PathBuf> {
    let path = path.trim();

    if path.is_empty() {
        return Err(PathError::Empty);
    }

    let path_buf = PathBuf::from(expand_variables(path)?);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }

    env::current_dir()
        .map(|cwd| cwd.join(path_buf))
        .map_err(|err| PathError::CurrentDir { source: err })
}

/// Returns `$HOME`, falling back to the passwd entry of the current user.
pub fn home_dir() -> PathBuf {
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home);
    }

    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.dir)
        .unwrap_or_else(env::temp_dir)
}

/// `$XDG_CONFIG_HOME`, defaulting to `$HOME/.config`.
pub fn xdg_config_home() -> PathBuf {
    env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// `$XDG_CACHE_HOME`, defaulting to `$HOME/.cache`.
pub fn xdg_cache_home() -> PathBuf {
    env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".cache"))
}

fn expand_variables(path: &str) -> PathResult<String> {
    let mut result = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let name = consume_braced(&mut chars)?;
                push_env_var(&name, &mut result, path)?;
            }
            '$' => {
                let name = consume_var_name(&mut chars);
                if name.is_empty() {
                    result.push('$');
                } else {
                    push_env_var(&name, &mut result, path)?;
                }
            }
            '~' if result.is_empty() => result.push_str(&home_dir().to_string_lossy()),
            _ => result.push(c),
        }
    }

    Ok(result)
}

fn consume_braced(chars: &mut Peekable<Chars>) -> PathResult<String> {
    let mut name = String::new();

    for c in chars.by_ref() {
        if c == '}' {
            return Ok(name);
        }
        name.push(c);
    }

    Err(PathError::UnclosedVariable {
        input: format!("${{{name}"),
    })
}

fn consume_var_name(chars: &mut Peekable<Chars>) -> String {
    let mut name = String::new();
    while let Some(c) = chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
        name.push(c);
    }
    name
}

fn push_env_var(name: &str, result: &mut String, original: &str) -> PathResult<()> {
    let value = match name {
        "HOME" => home_dir().to_string_lossy().into_owned(),
        "XDG_CONFIG_HOME" => xdg_config_home().to_string_lossy().into_owned(),
        "XDG_CACHE_HOME" => xdg_cache_home().to_string_lossy().into_owned(),
        _ => {
            env::var(name).map_err(|_| {
                PathError::MissingEnvVar {
                    var: name.into(),
                    input: original.into(),
                }
            })?
        }
    };
    result.push_str(&value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_expand_variables() {
        env::set_var("REGFETCH_TEST_VAR", "value");
        assert_eq!(
            expand_variables("$REGFETCH_TEST_VAR/path").unwrap(),
            "value/path"
        );
        assert_eq!(
            expand_variables("${REGFETCH_TEST_VAR}/path").unwrap(),
            "value/path"
        );
        assert_eq!(expand_variables("cost$").unwrap(), "cost$");
        env::remove_var("REGFETCH_TEST_VAR");
    }

    #[test]
    #[serial]
    fn test_expand_variables_errors() {
        assert!(matches!(
            expand_variables("${UNCLOSED"),
            Err(PathError::UnclosedVariable { .. })
        ));
        assert!(matches!(
            expand_variables("$REGFETCH_SURELY_MISSING"),
            Err(PathError::MissingEnvVar { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_xdg_directories() {
        env::set_var("HOME", "/tmp/home");
        env::remove_var("XDG_CONFIG_HOME");
        env::remove_var("XDG_CACHE_HOME");

        assert_eq!(xdg_config_home(), PathBuf::from("/tmp/home/.config"));
        assert_eq!(xdg_cache_home(), PathBuf::from("/tmp/home/.cache"));

        env::set_var("XDG_CACHE_HOME", "/tmp/cache");
        assert_eq!(xdg_cache_home(), PathBuf::from("/tmp/cache"));
        env::remove_var("XDG_CACHE_HOME");
    }

    #[test]
    #[serial]
    fn test_resolve_path() {
        env::set_var("HOME", "/tmp/home");

        assert!(matches!(resolve_path("  "), Err(PathError::Empty)));
        assert_eq!(
            resolve_path("/absolute/path").unwrap(),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path("~/cache").unwrap(),
            PathBuf::from("/tmp/home/cache")
        );

        let relative = resolve_path("relative/dir").unwrap();
        assert!(relative.is_absolute());
        assert!(relative.ends_with("relative/dir"));
    }
}
