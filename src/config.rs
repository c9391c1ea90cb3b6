use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    PerchError,
    model::{Position, Transform},
    profile::{ModeRequest, OutputConstraint, Profile, ProfileStore},
};

pub struct LoadedConfig {
    pub path: PathBuf,
    pub store: ProfileStore,
}

/// Resolves the config path, writes the commented template when the file is
/// missing, and loads it.
pub fn load_or_create_default(explicit: Option<&Path>) -> Result<LoadedConfig, PerchError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if explicit.is_none() && !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                PerchError::Config(format!(
                    "failed to create config directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        fs::write(&path, default_config_template()).map_err(|err| {
            PerchError::Config(format!(
                "failed to write default config {}: {err}",
                path.display()
            ))
        })?;
        tracing::info!(path = %path.display(), "created default config.lua");
    }

    let store = load_from_path(&path)?;
    Ok(LoadedConfig { path, store })
}

pub fn load_from_path(path: &Path) -> Result<ProfileStore, PerchError> {
    if !path.exists() {
        return Err(PerchError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let values = load_lua_values(path)?;
    let profiles = parse_profiles(&values)?;
    tracing::debug!(path = %path.display(), profiles = profiles.len(), "parsed config");
    Ok(ProfileStore::new(profiles))
}

fn config_path() -> Result<PathBuf, PerchError> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Ok(PathBuf::from(xdg).join("perch").join("config.lua"));
    }

    if let Some(home) = std::env::var_os("HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home)
            .join(".config")
            .join("perch")
            .join("config.lua"));
    }

    Err(PerchError::Config(
        "unable to resolve config path: HOME and XDG_CONFIG_HOME are unset".to_owned(),
    ))
}

fn load_lua_values(path: &Path) -> Result<HashMap<String, String>, PerchError> {
    let output = Command::new("lua")
        .arg("-e")
        .arg(lua_loader_script())
        .env("PERCH_CONFIG_PATH", path)
        .output()
        .map_err(|err| PerchError::Config(format!("failed to execute lua: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let reason = if stderr.is_empty() {
            "lua exited with non-zero status".to_owned()
        } else {
            stderr
        };
        return Err(PerchError::Config(format!(
            "failed to load {}: {reason}",
            path.display()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_key_value_stdout(&stdout)
}

fn parse_key_value_stdout(stdout: &str) -> Result<HashMap<String, String>, PerchError> {
    let mut values = HashMap::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(PerchError::Config(format!("invalid lua output line: {line}")));
        };
        values.insert(key.trim().to_owned(), value.to_owned());
    }
    Ok(values)
}

/// Splits `<prefix><index>.<field>` keys into per-index field maps, ordered
/// by index.
fn group_indexed(
    values: &HashMap<String, String>,
    prefix: &str,
) -> Result<BTreeMap<usize, HashMap<String, String>>, PerchError> {
    let mut grouped = BTreeMap::<usize, HashMap<String, String>>::new();

    for (key, value) in values {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some((raw_index, field)) = rest.split_once('.') else {
            return Err(PerchError::Config(format!(
                "invalid key `{key}`: expected format {prefix}<index>.<field>"
            )));
        };
        if field.trim().is_empty() {
            return Err(PerchError::Config(format!("invalid key `{key}`: missing field")));
        }
        let index = raw_index.parse::<usize>().map_err(|err| {
            PerchError::Config(format!(
                "invalid key `{key}`: index is not a number ({err})"
            ))
        })?;
        grouped
            .entry(index)
            .or_default()
            .insert(field.to_owned(), value.clone());
    }

    Ok(grouped)
}

fn collect_indexed_values(
    values: &HashMap<String, String>,
    prefix: &str,
) -> Result<Vec<String>, PerchError> {
    let mut indexed = Vec::<(usize, String)>::new();

    for (key, value) in values {
        let Some(index_str) = key.strip_prefix(prefix) else {
            continue;
        };
        if index_str.contains('.') {
            continue;
        }

        let index = index_str.parse::<usize>().map_err(|err| {
            PerchError::Config(format!(
                "invalid indexed key `{key}`: index is not a number ({err})"
            ))
        })?;
        indexed.push((index, value.clone()));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, value)| value).collect())
}

pub(crate) fn parse_profiles(values: &HashMap<String, String>) -> Result<Vec<Profile>, PerchError> {
    let grouped = group_indexed(values, "profile.")?;
    let mut profiles: Vec<Profile> = Vec::with_capacity(grouped.len());

    for (index, fields) in grouped {
        let name = fields
            .get("name")
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("profile-{index}"));

        if profiles.iter().any(|profile| profile.name == name) {
            return Err(PerchError::Config(format!(
                "duplicate profile name `{name}`"
            )));
        }

        let outputs = group_indexed(&fields, "output.")?
            .into_iter()
            .map(|(output_index, output)| {
                parse_output(&output, &format!("profile `{name}` output {output_index}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let commands = collect_indexed_values(&fields, "exec.")?
            .into_iter()
            .filter(|command| !command.trim().is_empty())
            .collect();

        profiles.push(Profile::new(name, outputs, commands));
    }

    Ok(profiles)
}

fn parse_output(fields: &HashMap<String, String>, context: &str) -> Result<OutputConstraint, PerchError> {
    let selector = fields
        .get("match")
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| PerchError::Config(format!("{context}: missing `match`")))?;

    let mut output = OutputConstraint::new(selector);
    let context = format!("{context} (`{selector}`)");

    output.enabled = parse_optional_bool(fields, "enable", &context)?;

    let has_mode = fields
        .get("mode")
        .is_some_and(|raw| !raw.trim().is_empty());
    let has_explicit_size = fields.contains_key("width") || fields.contains_key("height");
    if has_mode && (has_explicit_size || fields.contains_key("refresh_hz")) {
        return Err(PerchError::Config(format!(
            "{context}: `mode` cannot be combined with width/height/refresh fields"
        )));
    }

    let (size, refresh_hz) = match fields.get("mode").filter(|_| has_mode) {
        Some(raw) => {
            let (width, height, refresh_hz) = parse_mode(raw, &context)?;
            (Some((width, height)), refresh_hz)
        }
        None => {
            let width = parse_optional_i32(fields, "width", &context)?;
            let height = parse_optional_i32(fields, "height", &context)?;
            let size = match (width, height) {
                (Some(width), Some(height)) => Some((width, height)),
                (None, None) => None,
                _ => {
                    return Err(PerchError::Config(format!(
                        "{context}: width and height must be set together"
                    )));
                }
            };
            (size, parse_optional_f64(fields, "refresh_hz", &context)?)
        }
    };

    if let Some(refresh_hz) = refresh_hz
        && refresh_hz <= 0.0
    {
        return Err(PerchError::Config(format!(
            "{context}: refresh_hz must be greater than 0"
        )));
    }

    match size {
        Some((width, height)) => {
            if width <= 0 || height <= 0 {
                return Err(PerchError::Config(format!(
                    "{context}: width and height must be greater than 0"
                )));
            }
            output.mode = Some(ModeRequest {
                width,
                height,
                refresh: refresh_hz.map(hz_to_mhz),
            });
        }
        None if refresh_hz.is_some() => {
            return Err(PerchError::Config(format!(
                "{context}: refresh_hz requires width and height"
            )));
        }
        None => {}
    }

    let x = parse_optional_i32(fields, "x", &context)?;
    let y = parse_optional_i32(fields, "y", &context)?;
    output.position = match (x, y) {
        (Some(x), Some(y)) => Some(Position::new(x, y)),
        (None, None) => None,
        _ => {
            return Err(PerchError::Config(format!(
                "{context}: x and y must be set together"
            )));
        }
    };

    output.scale = parse_optional_f64(fields, "scale", &context)?;
    if let Some(scale) = output.scale
        && scale <= 0.0
    {
        return Err(PerchError::Config(format!(
            "{context}: scale must be greater than 0"
        )));
    }

    output.transform = fields
        .get("transform")
        .map(|raw| parse_transform(raw, &context))
        .transpose()?;

    output.adaptive_sync = parse_optional_bool(fields, "adaptive_sync", &context)?;

    Ok(output)
}

fn hz_to_mhz(hz: f64) -> i32 {
    (hz * 1000.0).round() as i32
}

fn parse_optional_bool(
    fields: &HashMap<String, String>,
    field: &str,
    context: &str,
) -> Result<Option<bool>, PerchError> {
    let Some(raw) = fields.get(field) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(PerchError::Config(format!(
            "{context}: invalid value for {field}: {raw} (expected bool or 0/1)"
        ))),
    }
}

fn parse_optional_i32(
    fields: &HashMap<String, String>,
    field: &str,
    context: &str,
) -> Result<Option<i32>, PerchError> {
    let Some(raw) = fields.get(field) else {
        return Ok(None);
    };
    parse_i32_flexible(raw.trim(), &format!("{context}: {field}")).map(Some)
}

/// Accepts `1920` as well as Lua's float rendering `1920.0`.
fn parse_i32_flexible(raw: &str, key: &str) -> Result<i32, PerchError> {
    if let Ok(number) = raw.parse::<i32>() {
        return Ok(number);
    }

    let parsed = raw
        .parse::<f64>()
        .map_err(|err| PerchError::Config(format!("invalid value for {key}: {raw} ({err})")))?;
    if !parsed.is_finite()
        || parsed < i32::MIN as f64
        || parsed > i32::MAX as f64
        || parsed.fract() != 0.0
    {
        return Err(PerchError::Config(format!(
            "invalid value for {key}: {raw} (expected integer)"
        )));
    }

    Ok(parsed as i32)
}

fn parse_optional_f64(
    fields: &HashMap<String, String>,
    field: &str,
    context: &str,
) -> Result<Option<f64>, PerchError> {
    let Some(raw) = fields.get(field) else {
        return Ok(None);
    };
    let raw = raw.trim();
    let value = raw.parse::<f64>().map_err(|err| {
        PerchError::Config(format!("{context}: invalid value for {field}: {raw} ({err})"))
    })?;
    if !value.is_finite() {
        return Err(PerchError::Config(format!(
            "{context}: invalid value for {field}: {raw} (must be finite)"
        )));
    }
    Ok(Some(value))
}

/// `<width>x<height>` with an optional `@<refresh>[Hz]` suffix.
fn parse_mode(raw: &str, context: &str) -> Result<(i32, i32, Option<f64>), PerchError> {
    let key = format!("{context}: mode");
    let mode = raw.trim();

    let (size_part, refresh_part) = match mode.split_once('@') {
        Some((size, refresh)) => (size.trim(), Some(refresh.trim())),
        None => (mode, None),
    };

    let (width, height) = size_part
        .split_once('x')
        .or_else(|| size_part.split_once('X'))
        .ok_or_else(|| {
            PerchError::Config(format!(
                "invalid value for {key}: expected `<width>x<height>` or `<width>x<height>@<refresh>`"
            ))
        })?;

    let width = parse_i32_flexible(width.trim(), &key)?;
    let height = parse_i32_flexible(height.trim(), &key)?;

    let refresh_hz = match refresh_part {
        Some(raw_refresh) => {
            let raw_refresh = raw_refresh
                .strip_suffix("Hz")
                .or_else(|| raw_refresh.strip_suffix("hz"))
                .unwrap_or(raw_refresh)
                .trim();
            if raw_refresh.is_empty() {
                return Err(PerchError::Config(format!(
                    "invalid value for {key}: refresh rate must not be empty"
                )));
            }
            let parsed = raw_refresh.parse::<f64>().map_err(|err| {
                PerchError::Config(format!(
                    "invalid value for {key}: invalid refresh `{raw_refresh}` ({err})"
                ))
            })?;
            if !parsed.is_finite() {
                return Err(PerchError::Config(format!(
                    "invalid value for {key}: refresh must be finite"
                )));
            }
            Some(parsed)
        }
        None => None,
    };

    Ok((width, height, refresh_hz))
}

fn parse_transform(raw: &str, context: &str) -> Result<Transform, PerchError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "normal" | "0" => Ok(Transform::Normal),
        "90" => Ok(Transform::_90),
        "180" => Ok(Transform::_180),
        "270" => Ok(Transform::_270),
        "flipped" => Ok(Transform::Flipped),
        "flipped-90" => Ok(Transform::Flipped90),
        "flipped-180" => Ok(Transform::Flipped180),
        "flipped-270" => Ok(Transform::Flipped270),
        other => Err(PerchError::Config(format!(
            "{context}: invalid transform `{other}` (expected normal/90/180/270/flipped/flipped-90/flipped-180/flipped-270)"
        ))),
    }
}

fn default_config_template() -> &'static str {
    r#"-- perch config
-- File: ~/.config/perch/config.lua (or $XDG_CONFIG_HOME/perch/config.lua)
--
-- Profiles are tried in order. A profile matches when every connected
-- output is claimed by exactly one of its outputs. `match` is an output
-- name (eDP-1), a "<make> <model> <serial>" string, or "*".
-- Apply changes with: `perch reload`
return {
  profiles = {
    -- {
    --   name = "laptop",
    --   outputs = {
    --     { match = "eDP-1", enable = true, scale = 1.0 },
    --   },
    -- },
    --
    -- {
    --   name = "docked",
    --   outputs = {
    --     { match = "eDP-1", enable = false },
    --     {
    --       match = "Dell Inc. DELL U2720Q ABC123",
    --       -- Use ONE sizing method (do not mix):
    --       -- mode = "3840x2160@60"
    --       -- width = 3840, height = 2160, refresh_hz = 60
    --       mode = "3840x2160@60",
    --       position = { x = 0, y = 0 },     -- or x = 0, y = 0
    --       scale = 1.5,                     -- must be > 0
    --       transform = "normal",            -- normal/90/180/270/flipped/flipped-90/flipped-180/flipped-270
    --       adaptive_sync = false,
    --     },
    --   },
    --   exec = {
    --     "notify-send 'perch' 'docked'",
    --   },
    -- },
  },
}
"#
}

fn lua_loader_script() -> &'static str {
    r#"
local path = os.getenv("PERCH_CONFIG_PATH")
if type(path) ~= "string" or path == "" then
  io.stderr:write("PERCH_CONFIG_PATH is not set\n")
  os.exit(1)
end

local chunk, load_err = loadfile(path)
if not chunk then
  io.stderr:write(load_err .. "\n")
  os.exit(1)
end

local ok, result = pcall(chunk)
if not ok then
  io.stderr:write(tostring(result) .. "\n")
  os.exit(1)
end

local cfg = nil
if type(result) == "table" then
  cfg = result
elseif type(_G.config) == "table" then
  cfg = _G.config
else
  cfg = {}
end

local function fail(message)
  io.stderr:write(message .. "\n")
  os.exit(1)
end

local function emit(key, value)
  local rendered = tostring(value)
  if string.find(rendered, "\n", 1, true) then
    fail(key .. " must not contain a newline")
  end
  io.write(key)
  io.write("=")
  io.write(rendered)
  io.write("\n")
end

local function expect_table(name, value)
  if value ~= nil and type(value) ~= "table" then
    fail(name .. " must be a table")
  end
end

local function emit_string(name, value)
  if value == nil then
    return
  end
  if type(value) ~= "string" then
    fail(name .. " must be a string")
  end
  emit(name, value)
end

local function emit_number(name, value)
  if value == nil then
    return
  end
  if type(value) ~= "number" then
    fail(name .. " must be a number")
  end
  emit(name, value)
end

local function emit_bool_like(name, value)
  if value == nil then
    return
  end
  if type(value) == "boolean" or type(value) == "number" then
    emit(name, value)
    return
  end
  fail(name .. " must be a boolean or number")
end

local function pick(primary, fallback)
  if primary ~= nil then
    return primary
  end
  return fallback
end

local function emit_output(prefix, label, output)
  if type(output) ~= "table" then
    fail(label .. " must be a table")
  end

  emit_string(prefix .. "match", pick(output.match, pick(output.name, output.criteria)))

  local enable = pick(output.enable, output.enabled)
  if enable == nil and output.off ~= nil then
    if type(output.off) ~= "boolean" then
      fail(label .. ".off must be a boolean")
    end
    enable = not output.off
  end
  emit_bool_like(prefix .. "enable", enable)

  local position = output.position
  if position ~= nil and type(position) ~= "table" then
    fail(label .. ".position must be a table")
  end

  emit_string(prefix .. "mode", output.mode)
  emit_number(prefix .. "width", output.width)
  emit_number(prefix .. "height", output.height)
  emit_number(prefix .. "refresh_hz", pick(output.refresh_hz, pick(output.refresh, output.hz)))
  emit_number(prefix .. "x", pick(output.x, position and position.x or nil))
  emit_number(prefix .. "y", pick(output.y, position and position.y or nil))
  emit_number(prefix .. "scale", output.scale)
  if output.transform ~= nil then
    emit(prefix .. "transform", output.transform)
  end
  emit_bool_like(prefix .. "adaptive_sync", output.adaptive_sync)
end

local profiles = pick(cfg.profiles, _G.profiles)
expect_table("profiles", profiles)
if profiles then
  for index, profile in ipairs(profiles) do
    local label = "profiles[" .. tostring(index) .. "]"
    if type(profile) ~= "table" then
      fail(label .. " must be a table")
    end

    local prefix = "profile." .. tostring(index) .. "."
    emit_string(prefix .. "name", profile.name)

    local outputs = profile.outputs
    expect_table(label .. ".outputs", outputs)
    for output_index, output in ipairs(outputs or {}) do
      emit_output(
        prefix .. "output." .. tostring(output_index) .. ".",
        label .. ".outputs[" .. tostring(output_index) .. "]",
        output
      )
    end

    local exec = profile.exec
    if type(exec) == "string" then
      exec = { exec }
    end
    expect_table(label .. ".exec", exec)
    for command_index, command in ipairs(exec or {}) do
      if type(command) ~= "string" then
        fail(label .. ".exec[" .. tostring(command_index) .. "] must be a string")
      end
      emit(prefix .. "exec." .. tostring(command_index), command)
    end
  end
end
"#
}
