//! libxml2 engine
//!
//! Direct FFI to libxml2 (and, with the `xslt` feature, libxslt) implementing [`Engine`].
//!
//! ## Thread Safety Strategy
//!
//! According to the libxml2 documentation (http://xmlsoft.org/threads.html):
//!
//! - Validation is thread-safe for different documents
//! - Compiled schema structures are thread-safe for reading after parsing
//! - Applying a compiled stylesheet is thread-safe for different documents
//!
//! **Our Implementation:**
//! - **Compilation** (schemas, stylesheets, XPath): serialized behind one process-wide lock
//! - **Validation, evaluation, transformation**: fully parallel; every call creates its own
//!   context, compiled artifacts are shared read-only
//! - **Error collection**: structured error handlers write into a buffer owned by the calling
//!   thread (libxml2 keeps the global handler per thread)
//!
//! ## Artifact resolution
//!
//! libxml2 loads nested resources (xs:include, xsl:import, `document()`) through its external
//! entity loader, with references already merged against the including document's URL. We
//! install a loader once per process that forwards every load made while a
//! [`ResolverScope`] is active on the current thread to that scope's [`ArtifactResolver`],
//! so the repository boundary applies to nested references too. Loads outside a scope go to
//! the loader libxml2 had before.
//!
//! [`ArtifactResolver`]: crate::engine::ArtifactResolver

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock};

use libc::{c_char, c_int, c_void};
use tracing::{debug, warn};

use crate::engine::{
    ArtifactSource, Diagnostic, Engine, NamespaceBindings, ParseOutcome, Severity, SharedResolver,
};
use crate::error::{ArtifactKind, CompilationError, EngineError, EngineResult};

/// Global initialization flag for libxml2
///
/// libxml2's initialization functions are NOT thread-safe, so they run exactly once.
static LIBXML2_INIT: Once = Once::new();

/// Serializes every compilation (schema parsing is not thread-safe in libxml2)
static COMPILE_LOCK: Mutex<()> = Mutex::new(());

/// The entity loader that was active before ours was installed
static DEFAULT_ENTITY_LOADER: OnceLock<XmlExternalEntityLoader> = OnceLock::new();

const XML_PARSE_NONET: c_int = 1 << 11;
const XML_CHAR_ENCODING_NONE: c_int = 0;

// Opaque libxml2 structures
#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlNode {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserInput {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserInputBuffer {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlXPathContext {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlXPathCompExpr {
    _private: [u8; 0],
}

/// Leading fields of `xmlParserInput`, stable across libxml2 releases
#[repr(C)]
struct XmlParserInputHead {
    buf: *mut XmlParserInputBuffer,
    filename: *const c_char,
}

/// Leading fields of `xmlXPathContext`, stable across libxml2 releases
#[repr(C)]
struct XmlXPathContextHead {
    doc: *mut XmlDoc,
    node: *mut XmlNode,
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc =
    Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

pub type XmlExternalEntityLoader = Option<
    unsafe extern "C" fn(
        url: *const c_char,
        id: *const c_char,
        ctxt: *mut XmlParserCtxt,
    ) -> *mut XmlParserInput,
>;

pub type XmlFreeFunc = Option<unsafe extern "C" fn(mem: *mut c_void)>;

// External libxml2 FFI declarations
#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub static xmlFree: XmlFreeFunc;

    pub fn xmlInitParser();

    // Documents
    pub fn xmlReadMemory(
        buffer: *const c_char,
        size: c_int,
        url: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    pub fn xmlFreeDoc(doc: *mut XmlDoc);
    pub fn xmlDocDumpMemoryEnc(
        doc: *mut XmlDoc,
        mem: *mut *mut u8,
        size: *mut c_int,
        encoding: *const c_char,
    );

    // Errors and resource loading
    pub fn xmlSetStructuredErrorFunc(ctx: *mut c_void, handler: XmlStructuredErrorFunc);
    pub fn xmlGetExternalEntityLoader() -> XmlExternalEntityLoader;
    pub fn xmlSetExternalEntityLoader(loader: XmlExternalEntityLoader);
    pub fn xmlParserInputBufferCreateMem(
        mem: *const c_char,
        size: c_int,
        encoding: c_int,
    ) -> *mut XmlParserInputBuffer;
    pub fn xmlFreeParserInputBuffer(buffer: *mut XmlParserInputBuffer);
    pub fn xmlNewIOInputStream(
        ctxt: *mut XmlParserCtxt,
        input: *mut XmlParserInputBuffer,
        encoding: c_int,
    ) -> *mut XmlParserInput;
    pub fn xmlStrdup(cur: *const u8) -> *mut u8;

    // Schema parsing functions
    pub fn xmlSchemaNewParserCtxt(url: *const c_char) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaParse(ctxt: *const XmlSchemaParserCtxt) -> *mut XmlSchema;
    pub fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    pub fn xmlSchemaFree(schema: *mut XmlSchema);

    // Schema validation functions
    pub fn xmlSchemaNewValidCtxt(schema: *const XmlSchema) -> *mut XmlSchemaValidCtxt;
    pub fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    pub fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaValidateDoc(ctxt: *mut XmlSchemaValidCtxt, doc: *mut XmlDoc) -> c_int;

    // XPath
    pub fn xmlXPathNewContext(doc: *mut XmlDoc) -> *mut XmlXPathContext;
    pub fn xmlXPathFreeContext(ctxt: *mut XmlXPathContext);
    pub fn xmlXPathRegisterNs(
        ctxt: *mut XmlXPathContext,
        prefix: *const u8,
        ns_uri: *const u8,
    ) -> c_int;
    pub fn xmlXPathCtxtCompile(ctxt: *mut XmlXPathContext, expr: *const u8)
    -> *mut XmlXPathCompExpr;
    pub fn xmlXPathCompiledEvalToBoolean(
        comp: *mut XmlXPathCompExpr,
        ctxt: *mut XmlXPathContext,
    ) -> c_int;
    pub fn xmlXPathFreeCompExpr(comp: *mut XmlXPathCompExpr);
}

#[cfg(feature = "xslt")]
mod xslt {
    use super::XmlDoc;
    use libc::c_char;

    #[repr(C)]
    pub struct XsltStylesheet {
        _private: [u8; 0],
    }

    #[cfg_attr(target_os = "windows", link(name = "libxslt"))]
    #[cfg_attr(not(target_os = "windows"), link(name = "xslt"))]
    unsafe extern "C" {
        pub fn xsltParseStylesheetFile(filename: *const u8) -> *mut XsltStylesheet;
        pub fn xsltFreeStylesheet(style: *mut XsltStylesheet);
        pub fn xsltApplyStylesheet(
            style: *mut XsltStylesheet,
            doc: *mut XmlDoc,
            params: *const *const c_char,
        ) -> *mut XmlDoc;
    }
}

/// Structured error callback collecting into a `Vec<Diagnostic>` passed as user data
unsafe extern "C" fn structured_error_callback(user_data: *mut c_void, error: *mut xmlError) {
    if user_data.is_null() || error.is_null() {
        return;
    }
    let diagnostics = unsafe { &mut *(user_data as *mut Vec<Diagnostic>) };
    let error = unsafe { &*error };

    let message = if error.message.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(error.message) }
            .to_string_lossy()
            .trim()
            .to_string()
    };
    let severity = match error.level {
        1 => Severity::Warning,
        3 => Severity::Fatal,
        _ => Severity::Error,
    };

    diagnostics.push(
        Diagnostic {
            severity,
            message,
            line: None,
            column: None,
        }
        .at(error.line.max(0) as u32, error.int2.max(0) as u32),
    );
}

/// Routes the calling thread's generic libxml2 errors into a buffer until dropped
struct ErrorCapture {
    diagnostics: Box<Vec<Diagnostic>>,
}

impl ErrorCapture {
    fn start() -> Self {
        let mut diagnostics = Box::new(Vec::new());
        let sink = &mut *diagnostics as *mut Vec<Diagnostic> as *mut c_void;
        unsafe { xmlSetStructuredErrorFunc(sink, Some(structured_error_callback)) };
        Self { diagnostics }
    }

    fn finish(mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics)
    }
}

impl Drop for ErrorCapture {
    fn drop(&mut self) {
        unsafe { xmlSetStructuredErrorFunc(ptr::null_mut(), None) };
    }
}

struct ActiveResolver {
    resolver: SharedResolver,
    preloaded: Vec<ArtifactSource>,
    failures: Vec<String>,
}

thread_local! {
    static ACTIVE_RESOLVER: RefCell<Option<ActiveResolver>> = const { RefCell::new(None) };
}

/// Makes `resolver` answer every resource load libxml2 performs on this thread until dropped
struct ResolverScope {
    previous: Option<ActiveResolver>,
}

impl ResolverScope {
    fn enter(resolver: &SharedResolver, preloaded: &[ArtifactSource]) -> Self {
        let previous = ACTIVE_RESOLVER.with(|active| {
            active.borrow_mut().replace(ActiveResolver {
                resolver: Arc::clone(resolver),
                preloaded: preloaded.to_vec(),
                failures: Vec::new(),
            })
        });
        Self { previous }
    }

    /// Resolution failures recorded so far in this scope
    fn failures(&self) -> Vec<String> {
        ACTIVE_RESOLVER.with(|active| {
            active
                .borrow()
                .as_ref()
                .map(|scope| scope.failures.clone())
                .unwrap_or_default()
        })
    }
}

impl Drop for ResolverScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE_RESOLVER.with(|active| *active.borrow_mut() = previous);
    }
}

unsafe extern "C" fn repository_entity_loader(
    url: *const c_char,
    id: *const c_char,
    ctxt: *mut XmlParserCtxt,
) -> *mut XmlParserInput {
    let loaded = if url.is_null() {
        None
    } else {
        let system_id = decode_uri_escapes(&unsafe { CStr::from_ptr(url) }.to_string_lossy());
        ACTIVE_RESOLVER.with(|active| {
            let mut active = active.borrow_mut();
            let scope = active.as_mut()?;
            let result = match scope.preloaded.iter().find(|s| s.system_id == system_id) {
                Some(source) => Ok(source.clone()),
                None => scope.resolver.load(&system_id),
            };
            Some(result.map_err(|e| scope.failures.push(e.to_string())))
        })
    };

    match loaded {
        Some(Ok(source)) => unsafe { memory_input(ctxt, &source) },
        Some(Err(())) => ptr::null_mut(),
        None => match DEFAULT_ENTITY_LOADER.get().copied().flatten() {
            Some(default_loader) => unsafe { default_loader(url, id, ctxt) },
            None => ptr::null_mut(),
        },
    }
}

/// Build a parser input over a copy of `source`, named after its system identifier
unsafe fn memory_input(ctxt: *mut XmlParserCtxt, source: &ArtifactSource) -> *mut XmlParserInput {
    let Ok(size) = c_int::try_from(source.content.len()) else {
        return ptr::null_mut();
    };

    unsafe {
        let buffer = xmlParserInputBufferCreateMem(
            source.content.as_ptr() as *const c_char,
            size,
            XML_CHAR_ENCODING_NONE,
        );
        if buffer.is_null() {
            return ptr::null_mut();
        }

        let input = xmlNewIOInputStream(ctxt, buffer, XML_CHAR_ENCODING_NONE);
        if input.is_null() {
            xmlFreeParserInputBuffer(buffer);
            return ptr::null_mut();
        }

        // The filename becomes the document URL and thereby the base of nested references
        if let Ok(filename) = CString::new(source.system_id.as_str()) {
            let head = input as *mut XmlParserInputHead;
            (*head).filename = xmlStrdup(filename.as_ptr() as *const u8) as *const c_char;
        }
        input
    }
}

/// Undo the `%XX` escaping libxml2 applies when canonicalising paths
fn decode_uri_escapes(uri: &str) -> String {
    if !uri.contains('%') {
        return uri.to_string();
    }
    let bytes = uri.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            decoded.push(byte);
            i += 3;
            continue;
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn install_entity_loader() {
    LIBXML2_INIT.call_once(|| unsafe {
        xmlInitParser();
        let _ = DEFAULT_ENTITY_LOADER.set(xmlGetExternalEntityLoader());
        xmlSetExternalEntityLoader(Some(repository_entity_loader));
    });
}

fn compile_lock() -> MutexGuard<'static, ()> {
    COMPILE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn messages(diagnostics: &[Diagnostic]) -> Vec<String> {
    diagnostics.iter().map(ToString::to_string).collect()
}

/// Owned libxml2 document
pub struct XmlDocument {
    ptr: NonNull<XmlDoc>,
}

// Safety: a document is exclusively owned and only ever used by one thread at a time
unsafe impl Send for XmlDocument {}

impl XmlDocument {
    fn as_ptr(&self) -> *mut XmlDoc {
        self.ptr.as_ptr()
    }
}

impl Drop for XmlDocument {
    fn drop(&mut self) {
        unsafe { xmlFreeDoc(self.ptr.as_ptr()) };
    }
}

impl fmt::Debug for XmlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmlDocument")
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Thread-safe wrapper for libxml2 schema pointer with proper resource management
///
/// This wrapper ensures that:
/// - Schema pointers are properly freed when dropped
/// - The schema can be safely shared across threads (libxml2 schemas are thread-safe)
#[derive(Debug, Clone)]
pub struct XmlSchemaPtr {
    inner: Arc<XmlSchemaInner>,
}

#[derive(Debug)]
struct XmlSchemaInner {
    ptr: *mut XmlSchema,
    _phantom: PhantomData<XmlSchema>,
}

// Safety: libxml2 documentation states that xmlSchema structures are thread-safe for reading
unsafe impl Send for XmlSchemaInner {}
unsafe impl Sync for XmlSchemaInner {}

impl XmlSchemaPtr {
    /// # Safety
    ///
    /// The pointer must come from `xmlSchemaParse` and must not be freed by anyone else.
    unsafe fn from_raw(ptr: NonNull<XmlSchema>) -> Self {
        XmlSchemaPtr {
            inner: Arc::new(XmlSchemaInner {
                ptr: ptr.as_ptr(),
                _phantom: PhantomData,
            }),
        }
    }

    fn as_ptr(&self) -> *const XmlSchema {
        self.inner.ptr
    }
}

impl Drop for XmlSchemaInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlSchemaFree(self.ptr) };
            self.ptr = ptr::null_mut();
        }
    }
}

/// A schema built from one or more sources; a document must satisfy every part
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    parts: Vec<(String, XmlSchemaPtr)>,
}

impl CompiledSchema {
    pub fn system_ids(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(id, _)| id.as_str())
    }
}

/// Compiled XPath 1.0 expression plus the namespace bindings it is evaluated with
pub struct XPathPredicate {
    expression: String,
    namespaces: Vec<(CString, CString)>,
    compiled: NonNull<XmlXPathCompExpr>,
}

// Safety: compiled expressions are read-only during evaluation; each evaluation
// uses its own context
unsafe impl Send for XPathPredicate {}
unsafe impl Sync for XPathPredicate {}

impl XPathPredicate {
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Drop for XPathPredicate {
    fn drop(&mut self) {
        unsafe { xmlXPathFreeCompExpr(self.compiled.as_ptr()) };
    }
}

impl fmt::Debug for XPathPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XPathPredicate")
            .field("expression", &self.expression)
            .finish()
    }
}

/// Compiled XSLT stylesheet
pub struct XsltTransform {
    system_id: String,
    #[cfg(feature = "xslt")]
    stylesheet: NonNull<xslt::XsltStylesheet>,
}

// Safety: libxslt stylesheets are read-only while being applied
unsafe impl Send for XsltTransform {}
unsafe impl Sync for XsltTransform {}

impl XsltTransform {
    pub fn system_id(&self) -> &str {
        &self.system_id
    }
}

#[cfg(feature = "xslt")]
impl Drop for XsltTransform {
    fn drop(&mut self) {
        unsafe { xslt::xsltFreeStylesheet(self.stylesheet.as_ptr()) };
    }
}

impl fmt::Debug for XsltTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XsltTransform")
            .field("system_id", &self.system_id)
            .finish()
    }
}

/// [`Engine`] backed by libxml2 and libxslt
pub struct LibXml2Engine {
    _phantom: PhantomData<()>,
}

impl LibXml2Engine {
    /// Create an engine, initializing libxml2 and installing the repository-aware
    /// entity loader on first use. Safe to call any number of times.
    pub fn new() -> Self {
        install_entity_loader();
        LibXml2Engine {
            _phantom: PhantomData,
        }
    }

    /// Whether this build can compile and run transforms
    pub fn supports_transforms() -> bool {
        cfg!(feature = "xslt")
    }

    /// Refuse to run when transforms are unavailable; no scenario configuration loads without them
    pub fn require_transforms() -> EngineResult<()> {
        if Self::supports_transforms() {
            Ok(())
        } else {
            Err(EngineError::Unsupported {
                engine: "libxml2",
                operation: "XSLT transforms (rebuild with the `xslt` feature)".to_string(),
            })
        }
    }

    fn compile_schema_part(
        &self,
        source: &ArtifactSource,
        scope: &ResolverScope,
    ) -> Result<XmlSchemaPtr, CompilationError> {
        let failure = |diagnostics: Vec<String>| {
            CompilationError::new(ArtifactKind::Schema, &source.system_id, diagnostics)
        };
        let url = CString::new(source.system_id.as_str())
            .map_err(|_| failure(vec!["system identifier contains a NUL byte".to_string()]))?;

        let mut diagnostics: Vec<Diagnostic> = Vec::new();
        let capture = ErrorCapture::start();
        let schema = unsafe {
            let parser_ctxt = xmlSchemaNewParserCtxt(url.as_ptr());
            if parser_ctxt.is_null() {
                return Err(failure(vec![EngineError::MemoryAllocation.to_string()]));
            }
            xmlSchemaSetParserStructuredErrors(
                parser_ctxt,
                Some(structured_error_callback),
                &mut diagnostics as *mut Vec<Diagnostic> as *mut c_void,
            );
            let schema = xmlSchemaParse(parser_ctxt);
            xmlSchemaFreeParserCtxt(parser_ctxt);
            schema
        };
        diagnostics.extend(capture.finish());

        for warning in diagnostics.iter().filter(|d| !d.is_error()) {
            warn!("{}: {}", source.system_id, warning);
        }

        match NonNull::new(schema) {
            Some(schema) => Ok(unsafe { XmlSchemaPtr::from_raw(schema) }),
            None => {
                let mut reasons = scope.failures();
                reasons.extend(messages(&diagnostics));
                if reasons.is_empty() {
                    reasons.push("schema could not be parsed".to_string());
                }
                Err(failure(reasons))
            }
        }
    }
}

impl Default for LibXml2Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for LibXml2Engine {
    type Document = XmlDocument;
    type Schema = CompiledSchema;
    type Predicate = XPathPredicate;
    type Transform = XsltTransform;

    fn name(&self) -> &str {
        if Self::supports_transforms() {
            "libxml2/libxslt"
        } else {
            "libxml2"
        }
    }

    fn parse_document(
        &self,
        content: &[u8],
        system_id: &str,
    ) -> EngineResult<ParseOutcome<XmlDocument>> {
        let size = c_int::try_from(content.len()).map_err(|_| EngineError::InvalidInput {
            details: format!("{} exceeds the maximum document size", system_id),
        })?;
        let url = CString::new(system_id).map_err(|_| EngineError::InvalidInput {
            details: format!("system identifier '{}' contains a NUL byte", system_id),
        })?;

        let capture = ErrorCapture::start();
        let doc = unsafe {
            xmlReadMemory(
                content.as_ptr() as *const c_char,
                size,
                url.as_ptr(),
                ptr::null(),
                XML_PARSE_NONET,
            )
        };
        let diagnostics = capture.finish();

        match NonNull::new(doc) {
            Some(ptr) => {
                let document = XmlDocument { ptr };
                if diagnostics.iter().any(Diagnostic::is_error) {
                    Ok(ParseOutcome::Malformed(diagnostics))
                } else {
                    Ok(ParseOutcome::Parsed(document))
                }
            }
            None if diagnostics.is_empty() => Ok(ParseOutcome::Malformed(vec![
                Diagnostic::error("Document is empty or not well-formed"),
            ])),
            None => Ok(ParseOutcome::Malformed(diagnostics)),
        }
    }

    fn serialize(&self, document: &XmlDocument) -> EngineResult<String> {
        let mut memory: *mut u8 = ptr::null_mut();
        let mut size: c_int = 0;
        unsafe {
            xmlDocDumpMemoryEnc(document.as_ptr(), &mut memory, &mut size, c"UTF-8".as_ptr());
        }
        if memory.is_null() {
            return Err(EngineError::Serialization);
        }

        let text = unsafe {
            let bytes = std::slice::from_raw_parts(memory, size.max(0) as usize);
            String::from_utf8_lossy(bytes).into_owned()
        };
        unsafe {
            if let Some(free) = xmlFree {
                free(memory as *mut c_void);
            }
        }
        Ok(text)
    }

    fn compile_predicate(
        &self,
        expression: &str,
        namespaces: &NamespaceBindings,
    ) -> Result<XPathPredicate, CompilationError> {
        let failure = |diagnostics: Vec<String>| {
            CompilationError::new(ArtifactKind::Predicate, expression, diagnostics)
        };
        let c_expression = CString::new(expression)
            .map_err(|_| failure(vec!["expression contains a NUL byte".to_string()]))?;
        let bindings = namespaces
            .iter()
            .map(|(prefix, uri)| Ok((CString::new(prefix.as_str())?, CString::new(uri.as_str())?)))
            .collect::<Result<Vec<_>, std::ffi::NulError>>()
            .map_err(|_| failure(vec!["namespace binding contains a NUL byte".to_string()]))?;

        let _guard = compile_lock();
        let capture = ErrorCapture::start();
        let compiled = unsafe {
            let ctxt = xmlXPathNewContext(ptr::null_mut());
            if ctxt.is_null() {
                return Err(failure(vec![EngineError::MemoryAllocation.to_string()]));
            }
            for (prefix, uri) in &bindings {
                xmlXPathRegisterNs(ctxt, prefix.as_ptr() as *const u8, uri.as_ptr() as *const u8);
            }
            let compiled = xmlXPathCtxtCompile(ctxt, c_expression.as_ptr() as *const u8);
            xmlXPathFreeContext(ctxt);
            compiled
        };
        let diagnostics = capture.finish();

        match NonNull::new(compiled) {
            Some(compiled) => Ok(XPathPredicate {
                expression: expression.to_string(),
                namespaces: bindings,
                compiled,
            }),
            None if diagnostics.is_empty() => {
                Err(failure(vec!["invalid XPath expression".to_string()]))
            }
            None => Err(failure(messages(&diagnostics))),
        }
    }

    fn evaluate_predicate(
        &self,
        predicate: &XPathPredicate,
        document: &XmlDocument,
    ) -> EngineResult<bool> {
        let capture = ErrorCapture::start();
        let value = unsafe {
            let ctxt = xmlXPathNewContext(document.as_ptr());
            if ctxt.is_null() {
                return Err(EngineError::MemoryAllocation);
            }
            // Evaluate with the document node as context item
            (*(ctxt as *mut XmlXPathContextHead)).node = document.as_ptr() as *mut XmlNode;
            for (prefix, uri) in &predicate.namespaces {
                xmlXPathRegisterNs(ctxt, prefix.as_ptr() as *const u8, uri.as_ptr() as *const u8);
            }
            let value = xmlXPathCompiledEvalToBoolean(predicate.compiled.as_ptr(), ctxt);
            xmlXPathFreeContext(ctxt);
            value
        };
        let diagnostics = capture.finish();

        match value {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(EngineError::EvaluationFailed {
                expression: predicate.expression.clone(),
                details: if diagnostics.is_empty() {
                    "evaluation error".to_string()
                } else {
                    messages(&diagnostics).join("; ")
                },
            }),
        }
    }

    fn compile_schema(
        &self,
        sources: &[ArtifactSource],
        resolver: &SharedResolver,
    ) -> Result<CompiledSchema, CompilationError> {
        if sources.is_empty() {
            return Err(CompilationError::new(
                ArtifactKind::Schema,
                "<none>",
                vec!["no schema sources given".to_string()],
            ));
        }

        let _guard = compile_lock();
        let scope = ResolverScope::enter(resolver, sources);
        let mut parts = Vec::with_capacity(sources.len());
        for source in sources {
            debug!("Compiling schema {}", source.system_id);
            let part = self.compile_schema_part(source, &scope)?;
            parts.push((source.system_id.clone(), part));
        }
        Ok(CompiledSchema { parts })
    }

    fn validate(
        &self,
        schema: &CompiledSchema,
        document: &XmlDocument,
    ) -> EngineResult<Vec<Diagnostic>> {
        let mut all = Vec::new();
        for (_, part) in &schema.parts {
            let mut diagnostics: Vec<Diagnostic> = Vec::new();
            let code = unsafe {
                // Validation context is per call; the schema is shared read-only
                let valid_ctxt = xmlSchemaNewValidCtxt(part.as_ptr());
                if valid_ctxt.is_null() {
                    return Err(EngineError::MemoryAllocation);
                }
                xmlSchemaSetValidStructuredErrors(
                    valid_ctxt,
                    Some(structured_error_callback),
                    &mut diagnostics as *mut Vec<Diagnostic> as *mut c_void,
                );
                let code = xmlSchemaValidateDoc(valid_ctxt, document.as_ptr());
                xmlSchemaFreeValidCtxt(valid_ctxt);
                code
            };

            match code {
                0 => all.extend(diagnostics),
                n if n > 0 => {
                    if !diagnostics.iter().any(Diagnostic::is_error) {
                        diagnostics.push(Diagnostic::error(format!(
                            "Document is not valid ({} errors)",
                            n
                        )));
                    }
                    all.extend(diagnostics);
                }
                n => return Err(EngineError::ValidationInternal { code: n }),
            }
        }
        Ok(all)
    }

    #[cfg(feature = "xslt")]
    fn compile_transform(
        &self,
        source: &ArtifactSource,
        resolver: &SharedResolver,
    ) -> Result<XsltTransform, CompilationError> {
        let failure = |diagnostics: Vec<String>| {
            CompilationError::new(ArtifactKind::Transform, &source.system_id, diagnostics)
        };
        let url = CString::new(source.system_id.as_str())
            .map_err(|_| failure(vec!["system identifier contains a NUL byte".to_string()]))?;

        let _guard = compile_lock();
        let scope = ResolverScope::enter(resolver, std::slice::from_ref(source));
        let capture = ErrorCapture::start();
        let stylesheet = unsafe { xslt::xsltParseStylesheetFile(url.as_ptr() as *const u8) };
        let diagnostics = capture.finish();

        match NonNull::new(stylesheet) {
            Some(stylesheet) => Ok(XsltTransform {
                system_id: source.system_id.clone(),
                stylesheet,
            }),
            None => {
                let mut reasons = scope.failures();
                reasons.extend(messages(&diagnostics));
                if reasons.is_empty() {
                    reasons.push("stylesheet could not be compiled".to_string());
                }
                Err(failure(reasons))
            }
        }
    }

    #[cfg(not(feature = "xslt"))]
    fn compile_transform(
        &self,
        source: &ArtifactSource,
        _resolver: &SharedResolver,
    ) -> Result<XsltTransform, CompilationError> {
        Err(CompilationError::new(
            ArtifactKind::Transform,
            &source.system_id,
            vec!["this build has no XSLT support (enable the `xslt` feature)".to_string()],
        ))
    }

    #[cfg(feature = "xslt")]
    fn run_transform(
        &self,
        transform: &XsltTransform,
        document: &XmlDocument,
        resolver: &SharedResolver,
    ) -> EngineResult<XmlDocument> {
        let _scope = ResolverScope::enter(resolver, &[]);
        let capture = ErrorCapture::start();
        let result = unsafe {
            xslt::xsltApplyStylesheet(
                transform.stylesheet.as_ptr(),
                document.as_ptr(),
                ptr::null(),
            )
        };
        let diagnostics = capture.finish();

        NonNull::new(result)
            .map(|ptr| XmlDocument { ptr })
            .ok_or_else(|| EngineError::TransformFailed {
                transform: transform.system_id.clone(),
                details: if diagnostics.is_empty() {
                    "transformation produced no result".to_string()
                } else {
                    messages(&diagnostics).join("; ")
                },
            })
    }

    #[cfg(not(feature = "xslt"))]
    fn run_transform(
        &self,
        transform: &XsltTransform,
        _document: &XmlDocument,
        _resolver: &SharedResolver,
    ) -> EngineResult<XmlDocument> {
        Err(EngineError::Unsupported {
            engine: "libxml2",
            operation: format!("running transform {}", transform.system_id),
        })
    }
}
