//! Simulated runtime backing the engine integration tests.
//!
//! Assemblies are token maps with an explicit valid token range, and method
//! bodies are real function pointers behind entry slots, so redirections can
//! be verified by actually invoking the methods.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::ops::RangeInclusive;
use std::sync::atomic::AtomicPtr;
use std::sync::{Arc, Mutex};

use libpatch::descriptor::{MethodDescriptor, MethodToken};
use libpatch::runtime::{
    AssemblyImage, AssemblyLoader, EntryPoint, LoadError, MethodAttrs, MethodHandle, MethodImage,
    MethodSig, ModuleImage, ParamType, TokenError,
};
use libpatch::{PatchBatch, PatchUnit};

/// Module whose methods live in a token map, recording every probe.
pub struct FakeModule {
    /// Tokens considered in range for this module.
    range: RangeInclusive<i32>,
    /// Methods by token value.
    methods: Mutex<BTreeMap<i32, MethodHandle>>,
    /// Every token passed to `resolve_method`, in call order.
    probes: Mutex<Vec<i32>>,
}

impl FakeModule {
    pub fn new(range: RangeInclusive<i32>) -> Arc<Self> {
        Arc::new(Self {
            range,
            methods: Mutex::new(BTreeMap::new()),
            probes: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, handle: MethodHandle) {
        self.methods
            .lock()
            .unwrap()
            .insert(handle.token().value(), handle);
    }

    /// Drops the method at `token`, simulating an unload or a recompile that
    /// moved it.
    pub fn remove(&self, token: i32) {
        self.methods.lock().unwrap().remove(&token);
    }

    /// Tokens probed so far, in order.
    pub fn probes(&self) -> Vec<i32> {
        self.probes.lock().unwrap().clone()
    }
}

impl ModuleImage for FakeModule {
    fn resolve_method(&self, token: MethodToken) -> Result<MethodHandle, TokenError> {
        self.probes.lock().unwrap().push(token.value());
        if !self.range.contains(&token.value()) {
            return Err(TokenError::OutOfRange);
        }
        self.methods
            .lock()
            .unwrap()
            .get(&token.value())
            .cloned()
            .ok_or(TokenError::NotFound)
    }
}

/// Loader serving pre-registered assembly images, with injectable failures.
#[derive(Clone, Default)]
pub struct FakeLoader {
    /// Registered images by name.
    inner: Arc<Mutex<HashMap<String, Arc<AssemblyImage>>>>,
    /// Names that fail to load.
    failing: Arc<Mutex<HashSet<String>>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, assembly: Arc<AssemblyImage>) {
        self.inner
            .lock()
            .unwrap()
            .insert(assembly.name().to_string(), assembly);
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }
}

impl AssemblyLoader for FakeLoader {
    fn load(&self, name: &str) -> Result<Arc<AssemblyImage>, LoadError> {
        if self.failing.lock().unwrap().contains(name) {
            return Err(LoadError::Rejected(name.to_string()));
        }
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }
}

pub extern "C" fn ret_11() -> i32 {
    11
}
pub extern "C" fn ret_22() -> i32 {
    22
}
pub extern "C" fn ret_33() -> i32 {
    33
}
pub extern "C" fn ret_44() -> i32 {
    44
}
pub extern "C" fn ret_55() -> i32 {
    55
}
pub extern "C" fn ret_66() -> i32 {
    66
}

/// Builds a slot-dispatched method with `param_count` int parameters.
pub fn method(
    token: i32,
    name: &str,
    param_count: usize,
    body: extern "C" fn() -> i32,
) -> MethodHandle {
    method_with_attrs(token, name, param_count, MethodAttrs::empty(), body)
}

pub fn method_with_attrs(
    token: i32,
    name: &str,
    param_count: usize,
    attrs: MethodAttrs,
    body: extern "C" fn() -> i32,
) -> MethodHandle {
    let params = (0..param_count)
        .map(|_| ParamType::by_value("System.Int32"))
        .collect();
    MethodHandle::new(MethodImage::new(
        MethodToken(token),
        name,
        MethodSig {
            params,
            is_static: true,
        },
        attrs,
        EntryPoint::Slot(Arc::new(AtomicPtr::new(body as *mut u8))),
    ))
}

/// Calls through the method's current entry pointer.
pub fn invoke(handle: &MethodHandle) -> i32 {
    // Safety: every test body is an extern "C" fn() -> i32 and slots only
    // ever hold such bodies.
    unsafe {
        let f: extern "C" fn() -> i32 = mem::transmute(handle.entry_ptr());
        f()
    }
}

pub fn descriptor(assembly: &str, simple_name: &str, token: i32) -> MethodDescriptor {
    MethodDescriptor {
        assembly_name: assembly.to_string(),
        display_name: format!("Game.Player.{simple_name}()"),
        simple_name: simple_name.to_string(),
        metadata_token: MethodToken(token),
        generic_type_arguments: Vec::new(),
    }
}

pub fn assembly(name: &str, module: Arc<FakeModule>) -> Arc<AssemblyImage> {
    Arc::new(AssemblyImage::new(
        name,
        None,
        vec![module as Arc<dyn ModuleImage>],
    ))
}

pub fn unit(id: &str, patch_assembly: &str, pairs: Vec<(MethodDescriptor, MethodDescriptor)>) -> PatchUnit {
    let (modified_methods, patch_methods) = pairs.into_iter().unzip();
    PatchUnit {
        id: id.to_string(),
        patch_assembly: patch_assembly.to_string(),
        new_methods: Vec::new(),
        modified_methods,
        patch_methods,
    }
}

pub fn batch(id: &str, units: Vec<PatchUnit>) -> PatchBatch {
    PatchBatch {
        id: id.to_string(),
        units,
        failures: Vec::new(),
    }
}
