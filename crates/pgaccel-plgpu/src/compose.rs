//! Source composer.
//!
//! Emits the self-contained translation unit handed to the external
//! compiler: fixed header macros, the declaration block, a typed entry
//! function wrapping the main block, and the fixed host-side template that
//! shuttles arguments and results through the shared-memory segments. The
//! output is deterministic; its digest keys the compile cache.

use sha2::{Digest, Sha256};

use pgaccel_common::platform::{MAXIMUM_ALIGNOF, NAMEDATALEN};
use pgaccel_core::catalog::ProcRecord;
use pgaccel_core::types::HostType;

use crate::source::ExpandedSource;

#[derive(Clone, Debug)]
pub struct FlatSource {
    pub text: String,
    pub digest: String,
}

/// Host type to device local type, encoded as data so the closed mapping
/// stays visible in one place.
const DEVICE_TYPE_TABLE: &[(HostType, &str)] = &[
    (HostType::Bool, "cl_char"),
    (HostType::Int2, "cl_short"),
    (HostType::Int4, "cl_int"),
    (HostType::Int8, "cl_long"),
    (HostType::Float4, "float"),
    (HostType::Float8, "double"),
    (HostType::Bytea, "varlena *"),
    (HostType::Text, "varlena *"),
    (HostType::Uuid, "void *"),
    (HostType::GStore, "void *"),
];

fn device_type_token(ty: HostType) -> &'static str {
    DEVICE_TYPE_TABLE
        .iter()
        .find(|(t, _)| *t == ty)
        .map(|(_, token)| *token)
        .expect("every host type has a device token")
}

/// Result slot typing: a gstore result is returned as its table identifier.
fn result_type_token(ty: HostType) -> (&'static str, i16, bool) {
    if ty == HostType::GStore {
        ("cl_uint", 4, true)
    } else {
        (device_type_token(ty), ty.len(), ty.byval())
    }
}

pub fn make_flat_source(proc: &ProcRecord, expanded: &ExpandedSource) -> FlatSource {
    let mut source = String::new();

    source.push_str(&format!(
        "/* ----------------------------------------\n\
         \x20* GPU procedure ({})\n\
         \x20* ----------------------------------------*/\n\
         #define MAXIMUM_ALIGNOF {}\n\
         #define NAMEDATALEN {}\n\
         #define KERN_CONTEXT_VARLENA_BUFSZ 0\n\
         #include \"cuda_common.h\"\n\
         #include <cuda_runtime.h>\n\n",
        proc.name, MAXIMUM_ALIGNOF, NAMEDATALEN,
    ));

    if let Some(decl) = &expanded.decl {
        source.push_str(decl);
    }

    let (ret_label, ret_len, ret_byval) = result_type_token(proc.ret_type);
    source.push_str(&format!(
        "typedef {ret_label} PLGPU_RESULT_TYPE;\n\
         #define PLGPU_RESULT_TYPBYVAL {}\n\
         #define PLGPU_RESULT_TYPLEN   {ret_len}\n\
         #define PLGPU_NUM_ARGS        {}\n\
         #define PLGPU_ARG_ISNULL(x)   (p_args[(x)] == NULL)\n\
         #define PLGPU_GET_ARGVAL(x,type) (PLGPU_ARG_ISNULL(x) ? 0 : *((type *)p_args[(x)]))\n\
         \n\
         static PLGPU_RESULT_TYPE plgpu_main(void *p_args[])\n\
         {{\n\
         \x20 {ret_label} retval = {};\n",
        ret_byval as i32,
        proc.arg_types.len(),
        if ret_label.contains('*') { "NULL" } else { "0" },
    ));

    for (i, &ty) in proc.arg_types.iter().enumerate() {
        let label = device_type_token(ty);
        if ty.byval() && ty != HostType::GStore {
            source.push_str(&format!(
                "  {label} arg{} __attribute__((unused)) = PLGPU_GET_ARGVAL({i},{label});\n",
                i + 1,
            ));
        } else {
            source.push_str(&format!(
                "  {label} arg{} __attribute__((unused)) = p_args[{i}];\n",
                i + 1,
            ));
        }
    }

    match &expanded.main {
        Some(main) => source.push_str(&format!("{{\n{main}}}\n")),
        None => source.push_str("exit(1);\n"), // NULL result
    }
    source.push_str("  return retval;\n}\n\n");

    source.push_str(HOST_TEMPLATE);

    let digest = hex_digest(&source);
    FlatSource {
        text: source,
        digest,
    }
}

fn hex_digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(hash.len() * 2);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Fixed host-side template: parses the segment names and argument tokens,
/// maps the segments, invokes `plgpu_main` and writes the result back.
/// Exit status 0 carries a result, 1 the null value.
const HOST_TEMPLATE: &str = r#"/* ---- host-side launcher template ---- */
#include <fcntl.h>
#include <stdio.h>
#include <stdlib.h>
#include <string.h>
#include <sys/mman.h>
#include <sys/stat.h>
#include <unistd.h>

int main(int argc, char *argv[])
{
  const char *argbuf_name = NULL;
  const char *result_name = NULL;
  char       *argbuf = NULL;
  void       *p_args[PLGPU_NUM_ARGS];
  size_t      argbuf_sz = 0;
  int         c, i = 0;

  while ((c = getopt(argc, argv, "a:r:")) >= 0)
  {
    if (c == 'a')
      argbuf_name = optarg;
    else if (c == 'r')
      result_name = optarg;
    else
      exit(2);
  }

  if (argbuf_name)
  {
    struct stat stbuf;
    int fdesc = shm_open(argbuf_name, O_RDONLY, 0600);
    if (fdesc < 0 || fstat(fdesc, &stbuf) != 0)
      exit(2);
    argbuf_sz = stbuf.st_size;
    argbuf = mmap(NULL, argbuf_sz, PROT_READ, MAP_SHARED, fdesc, 0);
    if (argbuf == MAP_FAILED)
      exit(2);
    close(fdesc);
  }

  for (i = 0; optind + i < argc && i < PLGPU_NUM_ARGS; i++)
  {
    const char *token = argv[optind + i];

    if (strcmp(token, "__null__") == 0)
      p_args[i] = NULL;
    else if (token[0] == 'v' && token[1] == ':')
    {
      static unsigned long __values[PLGPU_NUM_ARGS];
      __values[i] = strtoul(token + 2, NULL, 16);
      p_args[i] = &__values[i];
    }
    else if (token[0] == 'r' && token[1] == ':')
      p_args[i] = argbuf + strtoul(token + 2, NULL, 16);
    else if (token[0] == 'g' && token[1] == ':')
      p_args[i] = plgpu_resolve_gstore_handle(token + 2);
    else
      exit(2);
  }

  PLGPU_RESULT_TYPE retval = plgpu_main(p_args);

#if PLGPU_RESULT_TYPBYVAL
  plgpu_write_result(result_name, &retval, PLGPU_RESULT_TYPLEN);
#else
  if (retval == NULL)
    exit(1);          /* null result */
  plgpu_write_result(result_name, retval,
                     PLGPU_RESULT_TYPLEN > 0
                     ? PLGPU_RESULT_TYPLEN
                     : VARSIZE_ANY(retval));
#endif
  return 0;
}
"#;
