use super::args::{GetArgs, PutArgs};
use super::decode::{self, DecodeError};
use super::reply::Reply;
use crate::metrics::*;
use crate::store::{StoreClient, StoreError, StoredObject};
use crate::term::Term;

use ringlog::trace;

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Get(GetArgs),
    Put(PutArgs),
    Delete(GetArgs),
    CreateUpdate(PutArgs),
    Update(PutArgs),
}

impl Request {
    pub fn decode(payload: &Term) -> Result<Self, DecodeError> {
        let elements = decode::tuple(payload, 2)?;
        let args = &elements[1];
        match decode::atom(&elements[0])? {
            "get" => Ok(Self::Get(GetArgs::try_from(args)?)),
            "put" => Ok(Self::Put(PutArgs::try_from(args)?)),
            "delete" => Ok(Self::Delete(GetArgs::try_from(args)?)),
            "create_update" => Ok(Self::CreateUpdate(PutArgs::try_from(args)?)),
            "update" => Ok(Self::Update(PutArgs::try_from(args)?)),
            other => Err(DecodeError::UnknownOperation(other.to_owned())),
        }
    }

    fn target(&self) -> (&str, &str) {
        match self {
            Self::Get(a) | Self::Delete(a) => (a.bucket.as_str(), a.key.as_str()),
            Self::Put(a) | Self::CreateUpdate(a) | Self::Update(a) => {
                (a.bucket.as_str(), a.key.as_str())
            }
        }
    }
}

pub async fn execute(client: &dyn StoreClient, request: &Request) -> Reply {
    let result = match request {
        Request::Get(args) => {
            REQUEST_GET.increment();
            get(client, args).await
        }
        Request::Put(args) => {
            REQUEST_PUT.increment();
            put(client, args).await
        }
        Request::Delete(args) => {
            REQUEST_DELETE.increment();
            client
                .delete(&args.bucket, &args.key, args.r)
                .await
                .map(|_| Reply::Ok)
        }
        Request::CreateUpdate(args) => {
            REQUEST_CREATE_UPDATE.increment();
            create_update(client, args).await
        }
        Request::Update(args) => {
            REQUEST_UPDATE.increment();
            update(client, args).await
        }
    };

    match result {
        Ok(reply) => {
            match &reply {
                Reply::OkDetail(detail) if detail == "notfound" => RESPONSE_NOTFOUND.increment(),
                Reply::Error(_) => RESPONSE_NOTFOUND.increment(),
                _ => RESPONSE_OK.increment(),
            };
            reply
        }
        Err(e) => {
            RESPONSE_EX.increment();
            let (bucket, key) = request.target();
            Reply::Error(format!("{e} b : {bucket} k : {key}"))
        }
    }
}

async fn get(client: &dyn StoreClient, args: &GetArgs) -> Result<Reply, StoreError> {
    let object = client.fetch(&args.bucket, &args.key, args.r).await?;
    Ok(Reply::found(!StoredObject::is_missing(object.as_ref())))
}

async fn put(client: &dyn StoreClient, args: &PutArgs) -> Result<Reply, StoreError> {
    let object = StoredObject::new(&args.bucket, &args.key, args.value.clone());
    client.store(object, args.w, args.dw).await?;
    Ok(Reply::Ok)
}

async fn existing(
    client: &dyn StoreClient,
    args: &PutArgs,
) -> Result<Option<StoredObject>, StoreError> {
    let object = client.fetch(&args.bucket, &args.key, args.r).await?;
    if StoredObject::is_missing(object.as_ref()) {
        Ok(None)
    } else {
        Ok(object)
    }
}

async fn create_update(client: &dyn StoreClient, args: &PutArgs) -> Result<Reply, StoreError> {
    let object = match existing(client, args).await? {
        Some(mut object) => {
            trace!("create_update {}/{}: found", args.bucket.trim_end(), args.key.trim_end());
            object.value = Some(args.value.clone());
            object
        }
        None => {
            trace!("create_update {}/{}: notfound", args.bucket.trim_end(), args.key.trim_end());
            StoredObject::new(&args.bucket, &args.key, args.value.clone())
        }
    };
    client.store(object, args.w, args.dw).await?;
    Ok(Reply::Ok)
}

async fn update(client: &dyn StoreClient, args: &PutArgs) -> Result<Reply, StoreError> {
    let Some(mut object) = existing(client, args).await? else {
        return Ok(Reply::Error("notfound".into()));
    };
    object.value = Some(args.value.clone());
    client.store(object, args.w, args.dw).await?;
    Ok(Reply::Ok)
}
