//! Cache-file sections around the main body: the worklist description,
//! the include-dependency list (with preferences and the source-text
//! offset placeholder), the loaded-module list, and the trailing
//! source-text section.

use std::io::{self, Cursor, Read, Write};

use runtime::{Runtime, Value, ValueId};
use tracing::warn;

use crate::error::RestoreError;
use crate::stream::{
    read_bytes, read_f64, read_i32, read_u64, write_f64, write_i32, write_u64,
};

/// One recorded include-dependency.
pub struct DepEntry {
    pub path: String,
    pub mtime: f64,
}

fn is_toplevel(rt: &Runtime, m: ValueId) -> bool {
    let module = rt.module(m);
    module.parent == Some(m) || module.parent == Some(rt.well_known().main_module)
}

fn toplevel_of(rt: &Runtime, mut m: ValueId) -> ValueId {
    for _ in 0..64 {
        if is_toplevel(rt, m) {
            return m;
        }
        m = rt.module(m).parent.expect("parentless module");
    }
    m
}

fn write_name(w: &mut dyn Write, name: &str) -> io::Result<()> {
    write_i32(w, name.len() as i32)?;
    w.write_all(name.as_bytes())
}

/// Worklist description: name, uuid pair, and build-id of each top-level
/// module being cached.
pub fn write_work_list(
    w: &mut dyn Write,
    rt: &Runtime,
    worklist: &[ValueId],
) -> io::Result<()> {
    for &m in worklist {
        if !is_toplevel(rt, m) {
            continue;
        }
        let module = rt.module(m);
        write_name(w, rt.symbol_name(module.name))?;
        write_u64(w, module.uuid.hi)?;
        write_u64(w, module.uuid.lo)?;
        write_u64(w, module.build_id)?;
    }
    write_i32(w, 0)
}

/// Skip the worklist section without interpreting it.
pub fn skip_work_list(r: &mut dyn Read) -> Result<(), RestoreError> {
    loop {
        let len = read_i32(r)?;
        if len == 0 {
            return Ok(());
        }
        let len = usize::try_from(len)
            .map_err(|_| RestoreError::Corrupt("negative worklist name length"))?;
        read_bytes(r, len + 3 * 8)?;
    }
}

/// The dependency list plus preferences, ending with the placeholder that
/// the save path later patches to the source-text offset. Returns the
/// placeholder's position.
pub fn write_dependency_list(
    f: &mut Cursor<Vec<u8>>,
    rt: &Runtime,
    worklist: &[ValueId],
    preferences: &[String],
    preferences_hash: u64,
) -> io::Result<u64> {
    let initial_pos = f.position();
    write_u64(f, 0)?; // total section size, patched below

    // unique (path, mtime) pairs, preserving first-seen order so the
    // topmost included file stays first
    let mut deps: Vec<(ValueId, String, f64)> = Vec::new();
    for d in &rt.require_dependencies {
        if !deps.iter().any(|(_, p, _)| *p == d.path) {
            deps.push((d.module, d.path.clone(), d.mtime));
        }
    }

    for (depmod, path, mtime) in &deps {
        write_name(f, path)?;
        write_f64(f, *mtime)?;
        let depmod_top = toplevel_of(rt, *depmod);
        let mut provides = 0i32;
        for &workmod in worklist {
            if !is_toplevel(rt, workmod) {
                continue;
            }
            provides += 1;
            if workmod == depmod_top {
                write_i32(f, provides)?;
                for segment in rt.module_path(*depmod) {
                    write_name(f, &segment)?;
                }
                break;
            }
        }
        write_i32(f, 0)?; // provider terminator
    }
    write_i32(f, 0)?; // dependency terminator

    for key in preferences {
        write_name(f, key)?;
    }
    write_i32(f, 0)?;
    write_u64(f, preferences_hash)?;

    // patch the section length, then leave the source-text placeholder
    let pos = f.position();
    f.set_position(initial_pos);
    write_u64(f, pos - initial_pos)?;
    f.set_position(pos);
    write_u64(f, 0)?; // source-text offset, patched at the end of save
    Ok(pos)
}

/// Parse the dependency list (for verification and inspection).
/// Consumes through the source-text placeholder.
pub fn read_dependency_list(r: &mut dyn Read) -> Result<Vec<DepEntry>, RestoreError> {
    let _total = read_u64(r)?;
    let mut deps = Vec::new();
    loop {
        let len = read_i32(r)?;
        if len == 0 {
            break;
        }
        let len = usize::try_from(len)
            .map_err(|_| RestoreError::Corrupt("negative dependency path length"))?;
        let path = String::from_utf8(read_bytes(r, len)?)
            .map_err(|_| RestoreError::Corrupt("non-utf8 dependency path"))?;
        let mtime = read_f64(r)?;
        // provider record: a 1-based index plus a module path, or nothing
        let provides = read_i32(r)?;
        if provides != 0 {
            loop {
                let seg = read_i32(r)?;
                if seg == 0 {
                    break;
                }
                let seg = usize::try_from(seg)
                    .map_err(|_| RestoreError::Corrupt("negative module path length"))?;
                read_bytes(r, seg)?;
            }
        }
        deps.push(DepEntry { path, mtime });
    }
    // preferences keys and hash
    loop {
        let len = read_i32(r)?;
        if len == 0 {
            break;
        }
        let len = usize::try_from(len)
            .map_err(|_| RestoreError::Corrupt("negative preference key length"))?;
        read_bytes(r, len)?;
    }
    let _prefs_hash = read_u64(r)?;
    let _srctext_offset = read_u64(r)?;
    Ok(deps)
}

/// Skip the dependency section using its recorded total size.
pub fn skip_dependency_list(r: &mut dyn Read) -> Result<(), RestoreError> {
    let total = read_u64(r)?;
    // the total counts from the length field itself through the section;
    // we already consumed the 8 length bytes, so the remainder lands just
    // past the source-text placeholder
    read_bytes(r, total as usize)?;
    Ok(())
}

/// Compare recorded dependency mtimes against the filesystem.
pub fn verify_dependency_mtimes(deps: &[DepEntry]) -> Result<(), RestoreError> {
    for dep in deps {
        let meta = std::fs::metadata(&dep.path)
            .map_err(|_| RestoreError::StaleDependency(dep.path.clone()))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if (mtime - dep.mtime).abs() > 1e-6 {
            return Err(RestoreError::StaleDependency(dep.path.clone()));
        }
    }
    Ok(())
}

/// Identity of every loaded module outside the worklist; the reader
/// refuses to proceed when its session disagrees.
pub fn write_mod_list(
    w: &mut dyn Write,
    rt: &Runtime,
    worklist: &[ValueId],
) -> io::Result<()> {
    let in_worklist = |m: ValueId| worklist.iter().any(|&work| rt.is_submodule(m, work));
    for &m in &rt.loaded_modules {
        if in_worklist(m) {
            continue;
        }
        let module = rt.module(m);
        write_name(w, rt.symbol_name(module.name))?;
        write_u64(w, module.uuid.hi)?;
        write_u64(w, module.uuid.lo)?;
        write_u64(w, module.build_id)?;
    }
    write_i32(w, 0)
}

/// Verify the recorded module list entry-by-entry against the session's
/// loaded modules.
pub fn read_verify_mod_list(
    r: &mut dyn Read,
    rt: &Runtime,
    loaded: &[ValueId],
) -> Result<(), RestoreError> {
    let mut i = 0;
    loop {
        let len = read_i32(r)?;
        if len == 0 && i == loaded.len() {
            return Ok(());
        }
        if len == 0 || i == loaded.len() {
            return Err(RestoreError::ModuleListMismatch(
                "wrong number of entries".into(),
            ));
        }
        let len = usize::try_from(len)
            .map_err(|_| RestoreError::Corrupt("negative module name length"))?;
        let name = String::from_utf8(read_bytes(r, len)?)
            .map_err(|_| RestoreError::Corrupt("non-utf8 module name"))?;
        let uuid_hi = read_u64(r)?;
        let uuid_lo = read_u64(r)?;
        let build_id = read_u64(r)?;
        let m = loaded[i];
        let ok = matches!(rt.get(m), Value::Module(_)) && {
            let module = rt.module(m);
            rt.symbol_name(module.name) == name
                && module.uuid.hi == uuid_hi
                && module.uuid.lo == uuid_lo
                && module.build_id == build_id
        };
        if !ok {
            return Err(RestoreError::ModuleListMismatch(format!(
                "expected {name}"
            )));
        }
        i += 1;
    }
}

/// Append the source text of each dependency and patch the offset left in
/// the dependency section. Each entry is `(path length, path, content
/// length, content)`; a zero length terminates.
pub fn write_source_text(
    f: &mut Cursor<Vec<u8>>,
    rt: &Runtime,
    srctext_pos: u64,
    include: bool,
) -> io::Result<()> {
    let main = rt.well_known().main_module;
    let srctext_start = f.position();
    f.set_position(srctext_pos);
    write_u64(f, srctext_start)?;
    f.set_position(srctext_start);
    if include {
        let mut written: Vec<&str> = Vec::new();
        for dep in &rt.require_dependencies {
            // ad-hoc dependencies recorded against Main may not be source
            if dep.module == main || dep.path.is_empty() {
                continue;
            }
            if written.contains(&dep.path.as_str()) {
                continue;
            }
            let content = match std::fs::read(&dep.path) {
                Ok(content) => content,
                Err(_) => {
                    warn!(path = %dep.path, "could not cache source text");
                    continue;
                }
            };
            written.push(&dep.path);
            write_name(f, &dep.path)?;
            write_u64(f, content.len() as u64)?;
            f.write_all(&content)?;
        }
    }
    write_i32(f, 0)
}
